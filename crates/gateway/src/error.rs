//! Error types for the gateway layer

use std::net::SocketAddr;

use thiserror::Error;

/// Failures while reading a command line
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unknown command")]
    UnknownCommand(String),

    #[error("Invalid arguments: expected {0}")]
    InvalidArguments(String),
}

impl ProtocolError {
    pub fn invalid(usage: impl Into<String>) -> Self {
        Self::InvalidArguments(usage.into())
    }
}

/// Listener and transport failures
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn bind(address: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind {
            address: address.to_string(),
            source,
        }
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
