//! Event envelopes pushed to online recipients.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sprout_database::{Conversation, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Direct,
    Channel,
}

/// Notification describing one newly delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub message_id: i64,
    pub sender_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    pub content: String,
    pub created_at: String,
    pub attachments: Vec<String>,
}

impl EventEnvelope {
    pub fn from_message(message: &Message) -> Self {
        let (kind, channel_id) = match message.conversation {
            Conversation::Direct { .. } => (EventKind::Direct, None),
            Conversation::Channel { channel_id } => (EventKind::Channel, Some(channel_id)),
        };

        Self {
            kind,
            message_id: message.id,
            sender_id: message.sender_id,
            channel_id,
            content: message.content.clone(),
            created_at: message.created_at.clone(),
            attachments: message.attachments.clone(),
        }
    }

    /// Serialize to a single JSON line that can be shared by every recipient.
    pub fn to_line(&self) -> serde_json::Result<Arc<str>> {
        serde_json::to_string(self).map(Arc::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(conversation: Conversation) -> Message {
        Message {
            id: 11,
            sender_id: 1,
            conversation,
            content: "hello".to_string(),
            attachments: vec!["photo.jpg".to_string()],
            created_at: "2024-05-01T10:00:00+00:00".to_string(),
            is_read: false,
            is_deleted: false,
        }
    }

    #[test]
    fn direct_envelope_omits_channel_id() {
        let line = EventEnvelope::from_message(&message(Conversation::Direct { recipient_id: 2 }))
            .to_line()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["kind"], "direct");
        assert_eq!(value["message_id"], 11);
        assert_eq!(value["sender_id"], 1);
        assert_eq!(value["content"], "hello");
        assert_eq!(value["attachments"][0], "photo.jpg");
        assert!(value.get("channel_id").is_none());
        assert!(!line.contains('\n'));
    }

    #[test]
    fn channel_envelope_carries_channel_id() {
        let envelope =
            EventEnvelope::from_message(&message(Conversation::Channel { channel_id: 5 }));
        assert_eq!(envelope.kind, EventKind::Channel);

        let parsed: EventEnvelope = serde_json::from_str(&envelope.to_line().unwrap()).unwrap();
        assert_eq!(parsed.channel_id, Some(5));
    }
}
