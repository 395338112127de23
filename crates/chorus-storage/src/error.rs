//! Storage error types.

use thiserror::Error;

/// Errors from durable storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The update row violates append-only constraints.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// The `(document_id, session_did)` pair was terminated and is
    /// permanently retired.
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    /// The storage backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
