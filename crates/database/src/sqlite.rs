//! `MessageStore` backed by a pooled SQLite connection.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::entities::{
    Channel, ChannelMember, ChannelUpdate, ConversationFilter, MemberRole, Message, NewChannel,
    NewMessage, Page,
};
use crate::repos::{ChannelRepository, MemberRepository, MessageRepository};
use crate::store::MessageStore;
use crate::types::StoreResult;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    messages: MessageRepository,
    channels: ChannelRepository,
    members: MemberRepository,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            messages: MessageRepository::new(pool.clone()),
            channels: ChannelRepository::new(pool.clone()),
            members: MemberRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, message: NewMessage) -> StoreResult<Message> {
        self.messages.insert(&message).await
    }

    async fn insert_attachment(&self, message_id: i64, reference: &str) -> StoreResult<()> {
        self.messages.insert_attachment(message_id, reference).await
    }

    async fn fetch_message(&self, message_id: i64) -> StoreResult<Option<Message>> {
        self.messages.find_by_id(message_id).await
    }

    async fn fetch_messages_by_conversation(
        &self,
        conversation: ConversationFilter,
        page: Page,
    ) -> StoreResult<Vec<Message>> {
        self.messages.find_by_conversation(conversation, page).await
    }

    async fn mark_message_read(&self, message_id: i64) -> StoreResult<()> {
        self.messages.mark_read(message_id).await
    }

    async fn soft_delete_message(&self, message_id: i64) -> StoreResult<()> {
        self.messages.soft_delete(message_id).await
    }

    async fn insert_channel(&self, channel: NewChannel) -> StoreResult<Channel> {
        self.channels.insert_with_admin(&channel).await
    }

    async fn fetch_channel(&self, channel_id: i64) -> StoreResult<Option<Channel>> {
        self.channels.find_by_id(channel_id).await
    }

    async fn fetch_channels_for_user(&self, user_id: i64) -> StoreResult<Vec<Channel>> {
        self.channels.find_by_member(user_id).await
    }

    async fn fetch_membership(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<ChannelMember>> {
        self.members.find(channel_id, user_id).await
    }

    async fn fetch_members(&self, channel_id: i64) -> StoreResult<Vec<ChannelMember>> {
        self.members.find_by_channel(channel_id).await
    }

    async fn insert_membership(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<ChannelMember> {
        self.members.insert(channel_id, user_id, role).await
    }

    async fn update_member_role(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()> {
        self.members.update_role(channel_id, user_id, role).await
    }

    async fn remove_membership(&self, channel_id: i64, user_id: i64) -> StoreResult<bool> {
        self.members.delete(channel_id, user_id).await
    }

    async fn update_channel_metadata(
        &self,
        channel_id: i64,
        update: &ChannelUpdate,
    ) -> StoreResult<()> {
        self.channels.update_metadata(channel_id, update).await
    }

    async fn soft_delete_channel_messages(&self, channel_id: i64) -> StoreResult<u64> {
        self.messages.soft_delete_by_channel(channel_id).await
    }

    async fn delete_channel(&self, channel_id: i64) -> StoreResult<()> {
        self.channels.delete_cascade(channel_id).await
    }
}
