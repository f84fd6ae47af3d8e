//! In-process `MessageStore` used by tests and ephemeral runs.
//!
//! All state sits behind one async mutex, so every operation (including the
//! deletion cascade) is applied atomically. The store counts calls and can be
//! switched into an unavailable mode to exercise failure paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::entities::{
    Channel, ChannelMember, ChannelUpdate, ConversationFilter, MemberRole, Message, NewChannel,
    NewMessage, Page,
};
use crate::store::MessageStore;
use crate::types::{StoreError, StoreResult};

#[derive(Default)]
struct MemoryState {
    next_message_id: i64,
    next_channel_id: i64,
    messages: BTreeMap<i64, Message>,
    channels: BTreeMap<i64, Channel>,
    /// Keyed by (channel_id, user_id); the value carries a join sequence for ordering.
    members: BTreeMap<(i64, i64), (u64, ChannelMember)>,
    join_sequence: u64,
}

impl MemoryState {
    fn add_member(&mut self, channel_id: i64, user_id: i64, role: MemberRole) -> ChannelMember {
        self.join_sequence += 1;
        let member = ChannelMember {
            channel_id,
            user_id,
            role,
            joined_at: chrono::Utc::now().to_rfc3339(),
        };
        self.members
            .insert((channel_id, user_id), (self.join_sequence, member.clone()));
        member
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store operations invoked so far, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// While set, every operation fails with `StoreError::Unavailable` and changes nothing.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn enter(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: NewMessage) -> StoreResult<Message> {
        self.enter()?;
        let mut state = self.state.lock().await;
        state.next_message_id += 1;
        let stored = Message {
            id: state.next_message_id,
            sender_id: message.sender_id,
            conversation: message.conversation,
            content: message.content,
            attachments: message.attachments,
            created_at: chrono::Utc::now().to_rfc3339(),
            is_read: false,
            is_deleted: false,
        };
        state.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn insert_attachment(&self, message_id: i64, reference: &str) -> StoreResult<()> {
        self.enter()?;
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))?;
        message.attachments.push(reference.to_string());
        Ok(())
    }

    async fn fetch_message(&self, message_id: i64) -> StoreResult<Option<Message>> {
        self.enter()?;
        let state = self.state.lock().await;
        Ok(state.messages.get(&message_id).cloned())
    }

    async fn fetch_messages_by_conversation(
        &self,
        conversation: ConversationFilter,
        page: Page,
    ) -> StoreResult<Vec<Message>> {
        self.enter()?;
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .rev()
            .filter(|message| !message.is_deleted && conversation.matches(message))
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_message_read(&self, message_id: i64) -> StoreResult<()> {
        self.enter()?;
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))?;
        message.is_read = true;
        Ok(())
    }

    async fn soft_delete_message(&self, message_id: i64) -> StoreResult<()> {
        self.enter()?;
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))?;
        message.is_deleted = true;
        Ok(())
    }

    async fn insert_channel(&self, channel: NewChannel) -> StoreResult<Channel> {
        self.enter()?;
        let mut state = self.state.lock().await;
        state.next_channel_id += 1;
        let stored = Channel {
            id: state.next_channel_id,
            name: channel.name,
            description: channel.description,
            creator_id: channel.creator_id,
            created_at: chrono::Utc::now().to_rfc3339(),
            visibility: channel.visibility,
        };
        state.channels.insert(stored.id, stored.clone());
        state.add_member(stored.id, stored.creator_id, MemberRole::Admin);
        Ok(stored)
    }

    async fn fetch_channel(&self, channel_id: i64) -> StoreResult<Option<Channel>> {
        self.enter()?;
        let state = self.state.lock().await;
        Ok(state.channels.get(&channel_id).cloned())
    }

    async fn fetch_channels_for_user(&self, user_id: i64) -> StoreResult<Vec<Channel>> {
        self.enter()?;
        let state = self.state.lock().await;
        Ok(state
            .channels
            .values()
            .filter(|channel| state.members.contains_key(&(channel.id, user_id)))
            .cloned()
            .collect())
    }

    async fn fetch_membership(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<ChannelMember>> {
        self.enter()?;
        let state = self.state.lock().await;
        Ok(state
            .members
            .get(&(channel_id, user_id))
            .map(|(_, member)| member.clone()))
    }

    async fn fetch_members(&self, channel_id: i64) -> StoreResult<Vec<ChannelMember>> {
        self.enter()?;
        let state = self.state.lock().await;
        let mut members: Vec<_> = state
            .members
            .range((channel_id, i64::MIN)..=(channel_id, i64::MAX))
            .map(|(_, entry)| entry.clone())
            .collect();
        members.sort_by_key(|(sequence, _)| *sequence);
        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn insert_membership(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<ChannelMember> {
        self.enter()?;
        let mut state = self.state.lock().await;
        if !state.channels.contains_key(&channel_id) {
            return Err(StoreError::Constraint(format!("channel {channel_id} does not exist")));
        }
        if state.members.contains_key(&(channel_id, user_id)) {
            return Err(StoreError::Constraint(format!(
                "user {user_id} is already a member of channel {channel_id}"
            )));
        }
        Ok(state.add_member(channel_id, user_id, role))
    }

    async fn update_member_role(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()> {
        self.enter()?;
        let mut state = self.state.lock().await;
        let (_, member) = state.members.get_mut(&(channel_id, user_id)).ok_or_else(|| {
            StoreError::not_found(format!("member {user_id} of channel {channel_id}"))
        })?;
        member.role = role;
        Ok(())
    }

    async fn remove_membership(&self, channel_id: i64, user_id: i64) -> StoreResult<bool> {
        self.enter()?;
        let mut state = self.state.lock().await;
        Ok(state.members.remove(&(channel_id, user_id)).is_some())
    }

    async fn update_channel_metadata(
        &self,
        channel_id: i64,
        update: &ChannelUpdate,
    ) -> StoreResult<()> {
        self.enter()?;
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| StoreError::not_found(format!("channel {channel_id}")))?;
        update.apply_to(channel);
        Ok(())
    }

    async fn soft_delete_channel_messages(&self, channel_id: i64) -> StoreResult<u64> {
        self.enter()?;
        let mut state = self.state.lock().await;
        let mut flagged = 0;
        for message in state.messages.values_mut() {
            if message.channel_id() == Some(channel_id) && !message.is_deleted {
                message.is_deleted = true;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn delete_channel(&self, channel_id: i64) -> StoreResult<()> {
        self.enter()?;
        let mut state = self.state.lock().await;
        if state.channels.remove(&channel_id).is_none() {
            return Err(StoreError::not_found(format!("channel {channel_id}")));
        }
        state.members.retain(|(channel, _), _| *channel != channel_id);
        for message in state.messages.values_mut() {
            if message.channel_id() == Some(channel_id) {
                message.is_deleted = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Conversation, Visibility};

    fn new_channel(creator_id: i64) -> NewChannel {
        NewChannel {
            name: "vegan-recipes".to_string(),
            description: String::new(),
            creator_id,
            visibility: Visibility::Public,
        }
    }

    #[tokio::test]
    async fn unavailable_store_rejects_and_counts_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = store.insert_channel(new_channel(1)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.call_count(), 1);

        store.set_unavailable(false);
        assert!(store.fetch_channel(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_channel_cascades_members_and_messages() {
        let store = MemoryStore::new();
        let channel = store.insert_channel(new_channel(1)).await.unwrap();
        store
            .insert_membership(channel.id, 2, MemberRole::Member)
            .await
            .unwrap();
        store
            .insert_message(NewMessage {
                sender_id: 2,
                conversation: Conversation::Channel { channel_id: channel.id },
                content: "hi".to_string(),
                attachments: Vec::new(),
            })
            .await
            .unwrap();

        store.delete_channel(channel.id).await.unwrap();

        assert!(store.fetch_channel(channel.id).await.unwrap().is_none());
        assert!(store.fetch_members(channel.id).await.unwrap().is_empty());
        let visible = store
            .fetch_messages_by_conversation(
                ConversationFilter::Channel { channel_id: channel.id },
                Page::default(),
            )
            .await
            .unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn members_are_listed_in_join_order() {
        let store = MemoryStore::new();
        let channel = store.insert_channel(new_channel(5)).await.unwrap();
        store
            .insert_membership(channel.id, 3, MemberRole::Member)
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .fetch_members(channel.id)
            .await
            .unwrap()
            .into_iter()
            .map(|member| member.user_id)
            .collect();
        assert_eq!(ids, vec![5, 3]);
    }
}
