//! Repository for message data access operations.

use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::entities::{Conversation, ConversationFilter, Message, NewMessage, Page};
use crate::types::{StoreError, StoreResult};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, recipient_id, channel_id, content, created_at, is_read, is_deleted";

/// Repository for message database operations
#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    /// Create a new message repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message and its attachments in one transaction
    pub async fn insert(&self, message: &NewMessage) -> StoreResult<Message> {
        let now = chrono::Utc::now().to_rfc3339();
        let (recipient_id, channel_id) = match message.conversation {
            Conversation::Direct { recipient_id } => (Some(recipient_id), None),
            Conversation::Channel { channel_id } => (None, Some(channel_id)),
        };

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO messages (sender_id, recipient_id, channel_id, content, created_at, is_read, is_deleted)
             VALUES (?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(message.sender_id)
        .bind(recipient_id)
        .bind(channel_id)
        .bind(&message.content)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let message_id = result.last_insert_rowid();

        for (position, reference) in message.attachments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO message_attachments (message_id, position, reference) VALUES (?, ?, ?)",
            )
            .bind(message_id)
            .bind(position as i64)
            .bind(reference)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            message_id,
            sender_id = message.sender_id,
            attachments = message.attachments.len(),
            "stored message"
        );

        Ok(Message {
            id: message_id,
            sender_id: message.sender_id,
            conversation: message.conversation,
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            created_at: now,
            is_read: false,
            is_deleted: false,
        })
    }

    /// Append an attachment after the existing ones
    pub async fn insert_attachment(&self, message_id: i64, reference: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::not_found(format!("message {message_id}")));
        }

        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM message_attachments WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO message_attachments (message_id, position, reference) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(position)
        .bind(reference)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Find a message by ID, including soft-deleted ones
    pub async fn find_by_id(&self, message_id: i64) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut messages = vec![message_from_row(&row)?];
        self.load_attachments(&mut messages).await?;
        Ok(messages.pop())
    }

    /// Page through the visible history of a conversation, newest first
    pub async fn find_by_conversation(
        &self,
        filter: ConversationFilter,
        page: Page,
    ) -> StoreResult<Vec<Message>> {
        let rows = match filter {
            ConversationFilter::Direct { user_a, user_b } => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE is_deleted = 0 AND channel_id IS NULL
                       AND ((sender_id = ? AND recipient_id = ?) OR (sender_id = ? AND recipient_id = ?))
                     ORDER BY id DESC LIMIT ? OFFSET ?"
                ))
                .bind(user_a)
                .bind(user_b)
                .bind(user_b)
                .bind(user_a)
                .bind(page.limit)
                .bind(page.offset)
                .fetch_all(&self.pool)
                .await?
            }
            ConversationFilter::Channel { channel_id } => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE is_deleted = 0 AND channel_id = ?
                     ORDER BY id DESC LIMIT ? OFFSET ?"
                ))
                .bind(channel_id)
                .bind(page.limit)
                .bind(page.offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        self.load_attachments(&mut messages).await?;
        Ok(messages)
    }

    /// Set the read flag
    pub async fn mark_read(&self, message_id: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("message {message_id}")));
        }
        Ok(())
    }

    /// Set the deleted flag
    pub async fn soft_delete(&self, message_id: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET is_deleted = 1 WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("message {message_id}")));
        }
        info!(message_id, "soft-deleted message");
        Ok(())
    }

    /// Flag every visible message of a channel as deleted
    pub async fn soft_delete_by_channel(&self, channel_id: i64) -> StoreResult<u64> {
        let result =
            sqlx::query("UPDATE messages SET is_deleted = 1 WHERE channel_id = ? AND is_deleted = 0")
                .bind(channel_id)
                .execute(&self.pool)
                .await?;

        debug!(channel_id, flagged = result.rows_affected(), "soft-deleted channel messages");
        Ok(result.rows_affected())
    }

    async fn load_attachments(&self, messages: &mut [Message]) -> StoreResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, reference FROM message_attachments WHERE message_id IN (",
        );
        let mut ids = builder.separated(", ");
        for message in messages.iter() {
            ids.push_bind(message.id);
        }
        ids.push_unseparated(") ORDER BY message_id, position");

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut by_message: HashMap<i64, Vec<String>> = HashMap::new();
        for row in rows {
            let message_id: i64 = row.try_get("message_id")?;
            let reference: String = row.try_get("reference")?;
            by_message.entry(message_id).or_default().push(reference);
        }

        for message in messages.iter_mut() {
            if let Some(references) = by_message.remove(&message.id) {
                message.attachments = references;
            }
        }
        Ok(())
    }
}

fn message_from_row(row: &SqliteRow) -> StoreResult<Message> {
    let id: i64 = row.try_get("id")?;
    let recipient_id: Option<i64> = row.try_get("recipient_id")?;
    let channel_id: Option<i64> = row.try_get("channel_id")?;

    let conversation = match (recipient_id, channel_id) {
        (Some(recipient_id), None) => Conversation::Direct { recipient_id },
        (None, Some(channel_id)) => Conversation::Channel { channel_id },
        _ => {
            return Err(StoreError::Query(format!(
                "message {id} does not have exactly one target"
            )))
        }
    };

    Ok(Message {
        id,
        sender_id: row.try_get("sender_id")?,
        conversation,
        content: row.try_get("content")?,
        attachments: Vec::new(),
        created_at: row.try_get("created_at")?,
        is_read: row.try_get("is_read")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}
