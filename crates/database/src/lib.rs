//! Sprout Database Crate
//!
//! The message store interface used by the messaging core, a pooled SQLite
//! implementation with migrations, and an in-process implementation for tests.

use sprout_config::DatabaseConfig;
use sqlx::SqlitePool;

pub mod connection;
pub mod entities;
pub mod memory;
pub mod migrations;
pub mod repos;
pub mod sqlite;
pub mod store;
pub mod types;

pub use connection::{prepare_database, DatabaseConnection};
pub use memory::MemoryStore;
pub use migrations::run_migrations;
pub use sqlite::SqliteStore;
pub use store::MessageStore;

pub use repos::{ChannelRepository, MemberRepository, MessageRepository};

pub use entities::{
    Channel, ChannelMember, ChannelUpdate, Conversation, ConversationFilter, MemberRole, Message,
    NewChannel, NewMessage, Page, Visibility,
};

pub use types::{StoreError, StoreResult};

/// Connect to the configured database and apply pending migrations
pub async fn initialize_database(config: &DatabaseConfig) -> StoreResult<SqlitePool> {
    let pool = prepare_database(config)
        .await
        .map_err(|e| StoreError::Unavailable(format!("{e:#}")))?;

    run_migrations(&pool).await?;

    Ok(pool)
}
