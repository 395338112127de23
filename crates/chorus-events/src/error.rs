//! Cache and bus error types.

use thiserror::Error;

/// Errors from the shared cache or event bus.
///
/// Both are graceful-degradation paths: callers log these and carry on
/// with the local map and the durable store.
#[derive(Debug, Error)]
pub enum BusError {
    /// A cache read or write failed.
    #[error("cache error: {0}")]
    Cache(String),

    /// Publishing an event failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// An event or cached record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for cache and bus operations.
pub type BusResult<T> = Result<T, BusError>;
