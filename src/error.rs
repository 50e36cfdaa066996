//! Error types for the Gatekeeper rate limiter.

use thiserror::Error;

use crate::codec::CodecError;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored bucket state could not be decoded
    #[error("Snapshot codec error: {0}")]
    Codec(#[from] CodecError),

    /// Redis command failures
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No pooled connection could be obtained
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The connection pool could not be built
    #[error("Failed to create connection pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    /// The store accepted a command but did not answer in time
    #[error("Bucket store did not respond within {0:?}")]
    Timeout(std::time::Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error means the bucket store could not be reached.
    ///
    /// Codec errors are not included; they surface regardless of the
    /// failure policy.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            GatekeeperError::Redis(_)
                | GatekeeperError::Pool(_)
                | GatekeeperError::Timeout(_)
                | GatekeeperError::Io(_)
        )
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
