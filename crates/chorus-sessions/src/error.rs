//! Session error types.

use thiserror::Error;

use chorus_storage::StoreError;

/// Errors from session lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session exists for the pair.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The pair was terminated and is permanently retired.
    #[error("session terminated: {0}")]
    Terminated(String),

    /// The durable store failed; the operation did not complete.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionTerminated(key) => Self::Terminated(key),
            other => Self::Store(other),
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
