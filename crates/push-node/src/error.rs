//! Error types for the push node.

use std::net::SocketAddr;

use push_proto::ProtoError;
use push_store::BackendError;
use thiserror::Error;

/// Errors that can occur in the push node.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// WebSocket error occurred.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The client broke the protocol. The connection is closed without reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame exceeded the configured size limit.
    #[error("message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProtoError> for ServerError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Encoding(msg) => Self::Serialization(msg),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
