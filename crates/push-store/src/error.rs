//! Backend error types.

use thiserror::Error;

/// Errors reported by a storage or registry backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached or timed out. Usually transient.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A conditional write was rejected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Internal(String),
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
