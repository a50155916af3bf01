//! Error types for the coordination crate.

use thiserror::Error;

/// Convenient alias for cache and idempotency results.
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Could not reach the backend (connect/reconnect failures).
    #[error("cache connection error: {0}")]
    Connection(String),

    /// A command failed after the connection was established.
    #[error("cache command error: {0}")]
    Command(String),

    /// Stored payload could not be (de)serialized.
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Coordination configuration failed validation at startup.
    #[error("invalid coordination config: {0}")]
    Config(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            CacheError::Connection(err.to_string())
        } else {
            CacheError::Command(err.to_string())
        }
    }
}
