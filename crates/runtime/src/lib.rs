use std::sync::Arc;

use anyhow::{Context, Result};
use sprout_auth::{HttpIdentityService, IdentityService};
use sprout_config::AppConfig;
use sprout_database::{initialize_database, MessageStore, SqliteStore};
use sprout_messaging::{ClientRegistry, MessagingService};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod telemetry {
    use anyhow::Result;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    /// Install the global fmt subscriber, filtered by `RUST_LOG` (default `info`).
    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_env_filter(env_filter)
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

#[derive(Clone)]
pub struct MessengerServices {
    pub db_pool: SqlitePool,
    pub registry: Arc<ClientRegistry>,
    pub messaging: Arc<MessagingService>,
}

impl MessengerServices {
    pub async fn initialise(config: &AppConfig) -> Result<Self> {
        let db_pool = initialize_database(&config.database)
            .await
            .context("failed to initialise database")?;

        let identity = HttpIdentityService::new(&config.identity)
            .context("failed to build identity service client")?;

        Ok(Self::assemble(db_pool, Arc::new(identity), config))
    }

    /// Wire the messaging core on top of an already migrated pool.
    pub fn assemble(
        db_pool: SqlitePool,
        identity: Arc<dyn IdentityService>,
        config: &AppConfig,
    ) -> Self {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::new(db_pool.clone()));
        let registry = Arc::new(ClientRegistry::new());
        let messaging = Arc::new(MessagingService::new(
            store,
            identity,
            Arc::clone(&registry),
            config.messaging.clone(),
        ));

        info!(
            max_message_size = config.messaging.max_message_size,
            identity = %config.identity.base_url,
            "messaging services ready"
        );

        Self {
            db_pool,
            registry,
            messaging,
        }
    }
}

/// Cancel `token` on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(?error, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(?error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => return,
    }

    info!("shutdown signal received");
    token.cancel();
}
