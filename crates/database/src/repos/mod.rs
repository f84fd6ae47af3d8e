//! Database repository implementations

pub mod channel_repository;
pub mod member_repository;
pub mod message_repository;

pub use channel_repository::ChannelRepository;
pub use member_repository::MemberRepository;
pub use message_repository::MessageRepository;
