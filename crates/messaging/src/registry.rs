//! Client registry.
//!
//! Maps each online user to the outbound queue of the connection that last
//! authenticated as that user. Delivery only ever reads from here; sessions
//! register on successful authentication and unregister while closing.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A line queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Reply to a command issued on the same connection.
    Reply(String),
    /// Serialized event envelope, shared between every recipient of a message.
    Event(Arc<str>),
}

impl OutboundFrame {
    pub fn as_str(&self) -> &str {
        match self {
            OutboundFrame::Reply(line) => line,
            OutboundFrame::Event(line) => line,
        }
    }
}

/// Result of attempting to queue a frame on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Queued,
    /// The queue was full; the frame was dropped.
    QueueFull,
    /// The connection is closing or gone.
    Closed,
}

/// The sending half of one connection's outbound queue, tagged with the
/// connection it belongs to.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: Uuid,
    sender: mpsc::Sender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn new(connection_id: Uuid, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue a frame without waiting.
    pub fn push(&self, frame: OutboundFrame) -> PushResult {
        match self.sender.try_send(frame) {
            Ok(()) => PushResult::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %self.connection_id, "outbound queue full, dropping frame");
                PushResult::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PushResult::Closed,
        }
    }
}

/// Thread-safe map from user id to that user's live connection.
///
/// Uses DashMap so concurrent register, unregister and lookup calls only
/// contend on a single shard and never await.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    connections: DashMap<i64, ConnectionHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user. The newest registration wins; the
    /// handle it replaced, if any, is returned.
    pub fn register(&self, user_id: i64, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let connection_id = handle.connection_id;
        let previous = self.connections.insert(user_id, handle);
        match &previous {
            Some(old) => info!(
                user_id,
                %connection_id,
                replaced = %old.connection_id,
                "user registered from a new connection"
            ),
            None => info!(user_id, %connection_id, "user online"),
        }
        previous
    }

    /// Remove a user's entry, but only while it still belongs to the given
    /// connection. A stale unregister leaves a newer registration in place.
    pub fn unregister(&self, user_id: i64, connection_id: Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(&user_id, |_, handle| handle.connection_id == connection_id)
            .is_some();
        if removed {
            info!(user_id, %connection_id, "user offline");
        } else {
            debug!(user_id, %connection_id, "unregister skipped, entry belongs to another connection");
        }
        removed
    }

    pub fn lookup(&self, user_id: i64) -> Option<ConnectionHandle> {
        self.connections
            .get(&user_id)
            .map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }
}
