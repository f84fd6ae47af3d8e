//! Repository for channel membership data access operations.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::entities::{ChannelMember, MemberRole};
use crate::types::{StoreError, StoreResult};

/// Repository for membership database operations
#[derive(Clone)]
pub struct MemberRepository {
    pool: SqlitePool,
}

impl MemberRepository {
    /// Create a new member repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find member by channel ID and user ID
    pub async fn find(&self, channel_id: i64, user_id: i64) -> StoreResult<Option<ChannelMember>> {
        let row = sqlx::query(
            "SELECT channel_id, user_id, role, joined_at
             FROM channel_members WHERE channel_id = ? AND user_id = ?",
        )
        .bind(channel_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(member_from_row).transpose()
    }

    /// Find all members of a channel in join order
    pub async fn find_by_channel(&self, channel_id: i64) -> StoreResult<Vec<ChannelMember>> {
        let rows = sqlx::query(
            "SELECT channel_id, user_id, role, joined_at
             FROM channel_members WHERE channel_id = ? ORDER BY joined_at ASC, user_id ASC",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }

    /// Add a member with the given role
    pub async fn insert(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<ChannelMember> {
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(channel_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!(channel_id, user_id, role = %role, "added member to channel");

        Ok(ChannelMember {
            channel_id,
            user_id,
            role,
            joined_at: now,
        })
    }

    /// Change a member's role
    pub async fn update_role(&self, channel_id: i64, user_id: i64, role: MemberRole) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE channel_members SET role = ? WHERE channel_id = ? AND user_id = ?")
                .bind(role.as_str())
                .bind(channel_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!(
                "member {user_id} of channel {channel_id}"
            )));
        }

        info!(channel_id, user_id, role = %role, "updated member role");
        Ok(())
    }

    /// Remove a member; returns whether a row was removed
    pub async fn delete(&self, channel_id: i64, user_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND user_id = ?")
            .bind(channel_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(channel_id, user_id, "removed member from channel");
        }
        Ok(removed)
    }
}

fn member_from_row(row: &SqliteRow) -> StoreResult<ChannelMember> {
    let role: String = row.try_get("role")?;
    Ok(ChannelMember {
        channel_id: row.try_get("channel_id")?,
        user_id: row.try_get("user_id")?,
        role: MemberRole::from(role.as_str()),
        joined_at: row.try_get("joined_at")?,
    })
}
