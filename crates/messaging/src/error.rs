//! Error types for the messaging core.

use std::future::Future;
use std::time::Duration;

use sprout_auth::IdentityError;
use sprout_database::{StoreError, StoreResult};
use thiserror::Error;
use tracing::warn;

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Not a member of channel {channel_id}")]
    NotMember { channel_id: i64 },

    #[error("Channel {channel_id} is private; an admin must add you")]
    PrivateChannelRequiresInvite { channel_id: i64 },

    #[error("Message too large: {size} bytes exceeds the limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Too many attachments: {count} exceeds the limit of {max}")]
    TooManyAttachments { count: usize, max: usize },

    #[error("Channel {channel_id} must keep at least one admin")]
    LastAdmin { channel_id: i64 },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Identity service unavailable: {message}")]
    IdentityServiceUnavailable { message: String },
}

impl MessagingError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn channel_not_found(channel_id: i64) -> Self {
        Self::not_found(format!("channel {channel_id}"))
    }

    pub fn message_not_found(message_id: i64) -> Self {
        Self::not_found(format!("message {message_id}"))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for MessagingError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => Self::NotFound { what },
            other => Self::StoreUnavailable {
                message: other.to_string(),
            },
        }
    }
}

impl From<IdentityError> for MessagingError {
    fn from(error: IdentityError) -> Self {
        Self::IdentityServiceUnavailable {
            message: error.to_string(),
        }
    }
}

/// Run one store call under a deadline. An elapsed deadline is reported as an
/// unavailable store.
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    call: impl Future<Output = StoreResult<T>>,
) -> MessagingResult<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result.map_err(MessagingError::from),
        Err(_) => {
            warn!(timeout_ms = deadline.as_millis() as u64, "store call timed out");
            Err(MessagingError::StoreUnavailable {
                message: format!("no answer within {}ms", deadline.as_millis()),
            })
        }
    }
}
