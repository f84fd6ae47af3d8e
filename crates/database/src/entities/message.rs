//! Message entity definitions

use serde::{Deserialize, Serialize};

/// Where a message is addressed. Exactly one target exists per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversation {
    Direct { recipient_id: i64 },
    Channel { channel_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub conversation: Conversation,
    pub content: String,
    pub attachments: Vec<String>,
    pub created_at: String,
    pub is_read: bool,
    pub is_deleted: bool,
}

impl Message {
    pub fn recipient_id(&self) -> Option<i64> {
        match self.conversation {
            Conversation::Direct { recipient_id } => Some(recipient_id),
            Conversation::Channel { .. } => None,
        }
    }

    pub fn channel_id(&self) -> Option<i64> {
        match self.conversation {
            Conversation::Channel { channel_id } => Some(channel_id),
            Conversation::Direct { .. } => None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.conversation, Conversation::Direct { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: i64,
    pub conversation: Conversation,
    pub content: String,
    pub attachments: Vec<String>,
}

/// Selects the history of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationFilter {
    /// Both directions of a direct exchange between two users.
    Direct { user_a: i64, user_b: i64 },
    Channel { channel_id: i64 },
}

impl ConversationFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match (*self, message.conversation) {
            (ConversationFilter::Direct { user_a, user_b }, Conversation::Direct { recipient_id }) => {
                (message.sender_id == user_a && recipient_id == user_b)
                    || (message.sender_id == user_b && recipient_id == user_a)
            }
            (ConversationFilter::Channel { channel_id }, Conversation::Channel { channel_id: id }) => {
                channel_id == id
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.max(0),
            offset: offset.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(sender_id: i64, recipient_id: i64) -> Message {
        Message {
            id: 1,
            sender_id,
            conversation: Conversation::Direct { recipient_id },
            content: "hello".to_string(),
            attachments: Vec::new(),
            created_at: String::new(),
            is_read: false,
            is_deleted: false,
        }
    }

    #[test]
    fn direct_filter_matches_both_directions() {
        let filter = ConversationFilter::Direct { user_a: 1, user_b: 2 };
        assert!(filter.matches(&direct(1, 2)));
        assert!(filter.matches(&direct(2, 1)));
        assert!(!filter.matches(&direct(1, 3)));
        assert!(!ConversationFilter::Channel { channel_id: 2 }.matches(&direct(1, 2)));
    }

    #[test]
    fn message_exposes_exactly_one_target() {
        let message = direct(1, 2);
        assert_eq!(message.recipient_id(), Some(2));
        assert_eq!(message.channel_id(), None);
        assert!(message.is_direct());
    }
}
