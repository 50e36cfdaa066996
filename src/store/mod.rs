//! Persistence of token buckets.
//!
//! Buckets live in an external key-value store under their key's raw
//! projection, encoded with a [`SnapshotCodec`](crate::codec::SnapshotCodec)
//! and set to expire once they would have refilled to capacity.

mod backend;
mod memory;
mod redis_store;

pub use backend::BucketStore;
pub use memory::MemoryBucketStore;
pub use redis_store::RedisBucketStore;

use std::time::Duration;

use crate::ratelimit::TokenBucket;

/// Default upper bound for an entry's TTL.
pub const DEFAULT_TTL_CEILING: Duration = Duration::from_secs(86400);

/// Smallest TTL the store accepts.
const MIN_TTL: Duration = Duration::from_millis(1);

/// TTL for a stored bucket: its time to full, bounded by `ceiling`.
pub(crate) fn entry_ttl(bucket: &TokenBucket, ceiling: Duration) -> Duration {
    bucket.time_to_full().min(ceiling).max(MIN_TTL)
}
