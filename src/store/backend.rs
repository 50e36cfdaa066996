//! Bucket store trait for abstracting Redis and in-memory implementations.

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{BucketKey, TokenBucket};

/// Trait for bucket store implementations.
///
/// The rate limiter only ever calls these methods while holding the shard
/// lock for `key`, so implementations need no per-key coordination of their
/// own.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the bucket stored under `key`.
    ///
    /// Returns `Ok(None)` when nothing is stored (or the entry has expired).
    /// Stored bytes that fail to decode are an error, not a miss.
    async fn load(&self, key: &BucketKey) -> Result<Option<TokenBucket>>;

    /// Store `bucket` under `key`, expiring once it would be full again.
    async fn save(&self, key: &BucketKey, bucket: &TokenBucket) -> Result<()>;

    /// Remove whatever is stored under `key`.
    async fn clear(&self, key: &BucketKey) -> Result<()>;
}
