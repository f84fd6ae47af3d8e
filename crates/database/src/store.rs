//! The narrow command/query interface the messaging core uses to reach storage.
//!
//! Every operation either succeeds or fails with no partial observable effect.
//! Multi-row mutations (message plus attachments, channel plus creator
//! membership, the channel deletion cascade) are applied atomically by each
//! implementation.

use async_trait::async_trait;

use crate::entities::{
    Channel, ChannelMember, ChannelUpdate, ConversationFilter, MemberRole, Message, NewChannel,
    NewMessage, Page,
};
use crate::types::StoreResult;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message together with its ordered attachment references.
    async fn insert_message(&self, message: NewMessage) -> StoreResult<Message>;

    /// Append one attachment reference to an existing message.
    async fn insert_attachment(&self, message_id: i64, reference: &str) -> StoreResult<()>;

    async fn fetch_message(&self, message_id: i64) -> StoreResult<Option<Message>>;

    /// Newest first, soft-deleted messages excluded.
    async fn fetch_messages_by_conversation(
        &self,
        conversation: ConversationFilter,
        page: Page,
    ) -> StoreResult<Vec<Message>>;

    async fn mark_message_read(&self, message_id: i64) -> StoreResult<()>;

    async fn soft_delete_message(&self, message_id: i64) -> StoreResult<()>;

    /// Create a channel and make its creator the sole admin.
    async fn insert_channel(&self, channel: NewChannel) -> StoreResult<Channel>;

    async fn fetch_channel(&self, channel_id: i64) -> StoreResult<Option<Channel>>;

    async fn fetch_channels_for_user(&self, user_id: i64) -> StoreResult<Vec<Channel>>;

    async fn fetch_membership(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<ChannelMember>>;

    async fn fetch_members(&self, channel_id: i64) -> StoreResult<Vec<ChannelMember>>;

    async fn insert_membership(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<ChannelMember>;

    async fn update_member_role(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()>;

    /// Returns `false` when no such membership existed.
    async fn remove_membership(&self, channel_id: i64, user_id: i64) -> StoreResult<bool>;

    async fn update_channel_metadata(
        &self,
        channel_id: i64,
        update: &ChannelUpdate,
    ) -> StoreResult<()>;

    /// Returns the number of messages newly flagged.
    async fn soft_delete_channel_messages(&self, channel_id: i64) -> StoreResult<u64>;

    /// Remove the channel and its memberships and soft-delete its messages, all or nothing.
    async fn delete_channel(&self, channel_id: i64) -> StoreResult<()>;
}
