//! Domain entities persisted by the message store

pub mod channel;
pub mod member;
pub mod message;

pub use channel::{Channel, ChannelUpdate, NewChannel, Visibility};
pub use member::{ChannelMember, MemberRole};
pub use message::{Conversation, ConversationFilter, Message, NewMessage, Page};
