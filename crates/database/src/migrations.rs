//! Database migrations

use sqlx::{migrate::Migrator, SqlitePool};
use tracing::info;

use crate::types::StoreResult;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Bring the schema up to date
pub async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    MIGRATOR.run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::prepare_database;
    use sprout_config::DatabaseConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_create_schema() {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", temp_dir.path().join("migrations.db").display()),
            max_connections: 1,
        };

        let pool = prepare_database(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
        // Applying twice is a no-op.
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(name,)| name).collect();

        for expected in ["channel_members", "channels", "message_attachments", "messages"] {
            assert!(names.iter().any(|name| name == expected), "missing table {expected}");
        }
    }
}
