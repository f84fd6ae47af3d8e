//! Fan-out of stored messages to online recipients.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sprout_database::{Conversation, Message, MessageStore};
use tracing::{debug, instrument};

use crate::error::{with_deadline, MessagingError, MessagingResult};
use crate::events::EventEnvelope;
use crate::registry::{ClientRegistry, OutboundFrame, PushResult};

/// What happened to one message during fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Users the message was addressed to, sender excluded.
    pub recipients: usize,
    /// Recipients whose connection queue accepted the event.
    pub delivered: usize,
}

pub struct DeliveryEngine {
    registry: Arc<ClientRegistry>,
    store: Arc<dyn MessageStore>,
    store_timeout: Duration,
}

impl DeliveryEngine {
    pub fn new(
        registry: Arc<ClientRegistry>,
        store: Arc<dyn MessageStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            store_timeout,
        }
    }

    /// Push an already persisted message to each online recipient exactly once.
    ///
    /// Offline recipients are skipped; they read the message from history later.
    #[instrument(skip(self, message), fields(message_id = message.id, sender_id = message.sender_id))]
    pub async fn deliver(&self, message: &Message) -> MessagingResult<DeliveryReport> {
        let recipients = self.recipients(message).await?;

        let line = EventEnvelope::from_message(message)
            .to_line()
            .map_err(|e| MessagingError::validation(format!("unable to encode event: {e}")))?;

        let mut report = DeliveryReport {
            recipients: recipients.len(),
            delivered: 0,
        };

        for user_id in recipients {
            let Some(handle) = self.registry.lookup(user_id) else {
                debug!(user_id, "recipient offline");
                continue;
            };

            match handle.push(OutboundFrame::Event(Arc::clone(&line))) {
                PushResult::Queued => report.delivered += 1,
                PushResult::QueueFull => {}
                PushResult::Closed => {
                    debug!(user_id, connection_id = %handle.connection_id(), "recipient connection closing")
                }
            }
        }

        debug!(
            recipients = report.recipients,
            delivered = report.delivered,
            "message fanned out"
        );
        Ok(report)
    }

    async fn recipients(&self, message: &Message) -> MessagingResult<Vec<i64>> {
        match message.conversation {
            Conversation::Direct { recipient_id } => Ok(vec![recipient_id]),
            Conversation::Channel { channel_id } => {
                let members =
                    with_deadline(self.store_timeout, self.store.fetch_members(channel_id))
                        .await?;

                let mut seen = HashSet::new();
                Ok(members
                    .into_iter()
                    .map(|member| member.user_id)
                    .filter(|user_id| *user_id != message.sender_id && seen.insert(*user_id))
                    .collect())
            }
        }
    }
}
