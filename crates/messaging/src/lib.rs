//! Sprout messaging core.
//!
//! Tracks which users are reachable, enforces channel membership and admin
//! rules, and fans stored messages out to online recipients.

pub mod channels;
pub mod delivery;
pub mod error;
pub mod events;
pub mod registry;
pub mod service;

pub use channels::{ChannelManager, JoinOutcome, LeaveOutcome};
pub use delivery::{DeliveryEngine, DeliveryReport};
pub use error::{MessagingError, MessagingResult};
pub use events::{EventEnvelope, EventKind};
pub use registry::{ClientRegistry, ConnectionHandle, OutboundFrame, PushResult};
pub use service::{MessagingService, SendReceipt};
