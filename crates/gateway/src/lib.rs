//! # Sprout Gateway Crate
//!
//! The line-oriented TCP front of the messaging backend: command parsing,
//! per-connection sessions and the bounded acceptor.
//!
//! ## Architecture
//!
//! - **Protocol**: one command per line, `OK ...` / `ERROR ...` replies
//! - **Session**: reader loop plus writer task around a bounded outbound queue
//! - **Server**: TCP listener limited by a session semaphore and stopped by a cancellation token

pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use error::{GatewayError, GatewayResult, ProtocolError};
pub use protocol::{Command, Reply, Verb};
pub use server::MessagingServer;
pub use session::{run_session, ConnectionSession, LineOutcome, SessionSettings, SessionState};
