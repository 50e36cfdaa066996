//! Versioned serialization of bucket snapshots.
//!
//! Every stored payload starts with one version byte. The byte selects the
//! [`SnapshotFormat`] that reads the rest, so entries written by an earlier
//! deployment stay readable after the layout changes. Only the codec's
//! current version is used for new writes.

mod binary;
mod gzip_json;
mod versioned;

pub use binary::{BinaryFormat, BINARY_VERSION};
pub use gzip_json::{GzipJsonFormat, GZIP_JSON_VERSION};
pub use versioned::VersionedCodec;

use thiserror::Error;

use crate::ratelimit::Snapshot;

/// Errors raised while encoding or decoding a snapshot.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Empty snapshot payload")]
    Empty,

    #[error("Unknown snapshot version: {0}")]
    UnknownVersion(u8),

    #[error("Truncated snapshot payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Malformed snapshot document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid snapshot: {0}")]
    Invalid(String),
}

/// Turns snapshots into stored bytes and back.
pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Snapshot, CodecError>;
}

/// One concrete byte layout, identified by its version byte.
///
/// Formats never see the version byte itself; [`VersionedCodec`] strips and
/// prepends it.
pub trait SnapshotFormat: Send + Sync {
    fn version(&self) -> u8;

    fn write(&self, snapshot: &Snapshot) -> Result<Vec<u8>, CodecError>;

    fn read(&self, body: &[u8]) -> Result<Snapshot, CodecError>;
}

/// Reject decoded snapshots that break bucket invariants.
pub(crate) fn validate(snapshot: &Snapshot) -> Result<(), CodecError> {
    if snapshot.capacity == 0 {
        return Err(CodecError::Invalid("capacity is zero".to_string()));
    }
    if snapshot.refill_amount == 0 {
        return Err(CodecError::Invalid("refill amount is zero".to_string()));
    }
    if snapshot.refill_period.is_zero() {
        return Err(CodecError::Invalid("refill period is zero".to_string()));
    }
    if snapshot.current_tokens > snapshot.capacity {
        return Err(CodecError::Invalid(format!(
            "{} tokens exceed capacity {}",
            snapshot.current_tokens, snapshot.capacity
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::DateTime;
    use std::time::Duration;

    use crate::ratelimit::Snapshot;

    pub fn sample_snapshot() -> Snapshot {
        Snapshot {
            capacity: 100,
            refill_period: Duration::new(123, 456_789),
            refill_amount: 10,
            last_refill_at: DateTime::from_timestamp(1_700_000_123, 987_654_321).unwrap(),
            current_tokens: 10,
        }
    }
}
