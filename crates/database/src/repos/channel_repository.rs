//! Repository for channel data access operations.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{info, warn};

use crate::entities::{Channel, ChannelUpdate, MemberRole, NewChannel, Visibility};
use crate::types::{StoreError, StoreResult};

/// Repository for channel database operations
#[derive(Clone)]
pub struct ChannelRepository {
    pool: SqlitePool,
}

impl ChannelRepository {
    /// Create a new channel repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a channel with its creator as the only admin.
    ///
    /// Both rows are written in one transaction, so a failed membership
    /// insert leaves no channel behind.
    pub async fn insert_with_admin(&self, channel: &NewChannel) -> StoreResult<Channel> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO channels (name, description, creator_id, created_at, is_private)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&channel.name)
        .bind(&channel.description)
        .bind(channel.creator_id)
        .bind(&now)
        .bind(channel.visibility == Visibility::Private)
        .execute(&mut *tx)
        .await?;

        let channel_id = result.last_insert_rowid();

        sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(channel_id)
        .bind(channel.creator_id)
        .bind(MemberRole::Admin.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            channel_id,
            creator_id = channel.creator_id,
            visibility = %channel.visibility,
            "created channel"
        );

        Ok(Channel {
            id: channel_id,
            name: channel.name.clone(),
            description: channel.description.clone(),
            creator_id: channel.creator_id,
            created_at: now,
            visibility: channel.visibility,
        })
    }

    /// Find a channel by ID
    pub async fn find_by_id(&self, channel_id: i64) -> StoreResult<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, name, description, creator_id, created_at, is_private
             FROM channels WHERE id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(channel_from_row).transpose()
    }

    /// Find all channels a user belongs to
    pub async fn find_by_member(&self, user_id: i64) -> StoreResult<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.description, c.creator_id, c.created_at, c.is_private
             FROM channels c
             JOIN channel_members m ON m.channel_id = c.id
             WHERE m.user_id = ?
             ORDER BY c.id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(channel_from_row).collect()
    }

    /// Apply a metadata update; an empty update only checks existence
    pub async fn update_metadata(&self, channel_id: i64, update: &ChannelUpdate) -> StoreResult<()> {
        if update.is_empty() {
            return match self.find_by_id(channel_id).await? {
                Some(_) => Ok(()),
                None => Err(StoreError::not_found(format!("channel {channel_id}"))),
            };
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE channels SET ");
        let mut assignments = builder.separated(", ");
        if let Some(name) = &update.name {
            assignments.push("name = ").push_bind_unseparated(name.clone());
        }
        if let Some(description) = &update.description {
            assignments
                .push("description = ")
                .push_bind_unseparated(description.clone());
        }
        if let Some(visibility) = update.visibility {
            assignments
                .push("is_private = ")
                .push_bind_unseparated(visibility == Visibility::Private);
        }
        builder.push(" WHERE id = ").push_bind(channel_id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("channel {channel_id}")));
        }

        info!(channel_id, ?update, "updated channel metadata");
        Ok(())
    }

    /// Delete a channel: soft-delete its messages, drop memberships, drop the row.
    ///
    /// The three steps share one transaction; on any failure none of them is visible.
    pub async fn delete_cascade(&self, channel_id: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let flagged = sqlx::query("UPDATE messages SET is_deleted = 1 WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let members = sqlx::query("DELETE FROM channel_members WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let removed = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if removed == 0 {
            warn!(channel_id, "attempted to delete a missing channel");
            tx.rollback().await?;
            return Err(StoreError::not_found(format!("channel {channel_id}")));
        }

        tx.commit().await?;

        info!(
            channel_id,
            members_removed = members,
            messages_flagged = flagged,
            "deleted channel"
        );
        Ok(())
    }
}

fn channel_from_row(row: &SqliteRow) -> StoreResult<Channel> {
    let is_private: bool = row.try_get("is_private")?;
    Ok(Channel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        creator_id: row.try_get("creator_id")?,
        created_at: row.try_get("created_at")?,
        visibility: Visibility::from_private_flag(is_private),
    })
}
