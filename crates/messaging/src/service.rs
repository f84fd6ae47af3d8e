//! Messaging service: limit checks, persistence and live delivery behind one API.

use std::sync::Arc;

use sprout_auth::{Identity, IdentityService};
use sprout_config::MessagingConfig;
use sprout_database::{Conversation, ConversationFilter, Message, MessageStore, NewMessage, Page};
use tracing::{debug, info, warn};

use crate::channels::ChannelManager;
use crate::delivery::{DeliveryEngine, DeliveryReport};
use crate::error::{with_deadline, MessagingError, MessagingResult};
use crate::registry::ClientRegistry;

/// A persisted message and the outcome of its fan-out.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message: Message,
    pub delivery: DeliveryReport,
}

pub struct MessagingService {
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityService>,
    registry: Arc<ClientRegistry>,
    channels: ChannelManager,
    delivery: DeliveryEngine,
    config: MessagingConfig,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityService>,
        registry: Arc<ClientRegistry>,
        config: MessagingConfig,
    ) -> Self {
        let store_timeout = config.store_timeout();
        Self {
            channels: ChannelManager::new(Arc::clone(&store), store_timeout),
            delivery: DeliveryEngine::new(Arc::clone(&registry), Arc::clone(&store), store_timeout),
            store,
            identity,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Resolve a token to an identity. A rejected token is `NotAuthenticated`.
    pub async fn authenticate(&self, token: &str) -> MessagingResult<Identity> {
        let result = self.identity.validate(token).await?;
        result.into_identity().ok_or(MessagingError::NotAuthenticated)
    }

    pub async fn send_direct(
        &self,
        sender_id: i64,
        recipient_id: i64,
        content: &str,
        attachments: Vec<String>,
    ) -> MessagingResult<SendReceipt> {
        self.check_limits(content, &attachments)?;

        let message = self
            .persist(NewMessage {
                sender_id,
                conversation: Conversation::Direct { recipient_id },
                content: content.to_string(),
                attachments,
            })
            .await?;

        info!(message_id = message.id, sender_id, recipient_id, "direct message stored");
        Ok(self.fan_out(message).await)
    }

    pub async fn send_channel(
        &self,
        sender_id: i64,
        channel_id: i64,
        content: &str,
        attachments: Vec<String>,
    ) -> MessagingResult<SendReceipt> {
        self.check_limits(content, &attachments)?;

        let message = {
            // Held until the row exists so a concurrent delete cannot slip in
            // between the membership check and the insert.
            let _guard = self.channels.lock(channel_id).await;
            self.channels.require_member(sender_id, channel_id).await?;
            self.persist(NewMessage {
                sender_id,
                conversation: Conversation::Channel { channel_id },
                content: content.to_string(),
                attachments,
            })
            .await?
        };

        info!(message_id = message.id, sender_id, channel_id, "channel message stored");
        Ok(self.fan_out(message).await)
    }

    /// Both directions of the exchange between `user_id` and `other_id`, newest first.
    pub async fn direct_history(
        &self,
        user_id: i64,
        other_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> MessagingResult<Vec<Message>> {
        let filter = ConversationFilter::Direct {
            user_a: user_id,
            user_b: other_id,
        };
        with_deadline(
            self.config.store_timeout(),
            self.store
                .fetch_messages_by_conversation(filter, self.page(limit, offset)),
        )
        .await
    }

    /// Channel history, newest first. Only members may read it.
    pub async fn channel_history(
        &self,
        user_id: i64,
        channel_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> MessagingResult<Vec<Message>> {
        self.channels.require_member(user_id, channel_id).await?;
        with_deadline(
            self.config.store_timeout(),
            self.store.fetch_messages_by_conversation(
                ConversationFilter::Channel { channel_id },
                self.page(limit, offset),
            ),
        )
        .await
    }

    /// Mark a direct message as read. Only its recipient may do so.
    pub async fn mark_read(&self, user_id: i64, message_id: i64) -> MessagingResult<()> {
        let message = self.visible_message(message_id).await?;
        if message.recipient_id() != Some(user_id) {
            return Err(MessagingError::forbidden(
                "only the recipient can mark a message as read",
            ));
        }

        with_deadline(
            self.config.store_timeout(),
            self.store.mark_message_read(message_id),
        )
        .await?;
        debug!(message_id, user_id, "message marked read");
        Ok(())
    }

    /// Soft-delete a message. Allowed for its sender, the recipient of a
    /// direct message, and admins of the channel a message was posted to.
    pub async fn delete_message(&self, user_id: i64, message_id: i64) -> MessagingResult<()> {
        let message = self.visible_message(message_id).await?;

        let allowed = message.sender_id == user_id
            || match message.conversation {
                Conversation::Direct { recipient_id } => recipient_id == user_id,
                Conversation::Channel { channel_id } => {
                    self.channels.is_admin(user_id, channel_id).await?
                }
            };
        if !allowed {
            return Err(MessagingError::forbidden(
                "only participants can delete this message",
            ));
        }

        with_deadline(
            self.config.store_timeout(),
            self.store.soft_delete_message(message_id),
        )
        .await?;
        info!(message_id, user_id, "message deleted");
        Ok(())
    }

    fn check_limits(&self, content: &str, attachments: &[String]) -> MessagingResult<()> {
        let max = self.config.max_message_size;
        if content.len() > max {
            return Err(MessagingError::MessageTooLarge {
                size: content.len(),
                max,
            });
        }

        let max = self.config.max_attachment_count;
        if attachments.len() > max {
            return Err(MessagingError::TooManyAttachments {
                count: attachments.len(),
                max,
            });
        }
        if attachments.iter().any(|reference| reference.trim().is_empty()) {
            return Err(MessagingError::validation("attachment reference is empty"));
        }

        if content.trim().is_empty() && attachments.is_empty() {
            return Err(MessagingError::validation("message is empty"));
        }
        Ok(())
    }

    fn page(&self, limit: Option<i64>, offset: Option<i64>) -> Page {
        let max = self.config.history_page_size.max(1);
        Page::new(limit.unwrap_or(max).clamp(1, max), offset.unwrap_or(0))
    }

    async fn persist(&self, message: NewMessage) -> MessagingResult<Message> {
        with_deadline(self.config.store_timeout(), self.store.insert_message(message)).await
    }

    /// Delivery failures do not undo a send; the message is already stored.
    async fn fan_out(&self, message: Message) -> SendReceipt {
        let delivery = match self.delivery.deliver(&message).await {
            Ok(report) => report,
            Err(error) => {
                warn!(message_id = message.id, %error, "live delivery failed");
                DeliveryReport::default()
            }
        };
        SendReceipt { message, delivery }
    }

    async fn visible_message(&self, message_id: i64) -> MessagingResult<Message> {
        with_deadline(
            self.config.store_timeout(),
            self.store.fetch_message(message_id),
        )
        .await?
        .filter(|message| !message.is_deleted)
        .ok_or_else(|| MessagingError::message_not_found(message_id))
    }
}
