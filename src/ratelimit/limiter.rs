//! Core rate limiter implementation.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::bucket::{Snapshot, TokenAcquireResult, TokenBucket};
use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use crate::config::BucketConfig;
use crate::error::Result;
use crate::store::BucketStore;

/// Number of independent locks keys are spread over.
pub const NUM_SHARDS: usize = 100;

/// Maps a key to a non-negative hash; the shard is the hash modulo [`NUM_SHARDS`].
pub type ShardHasher = fn(&BucketKey) -> u32;

/// Deterministic 31-multiplier polynomial hash over the key's raw projection.
pub fn string_hash(key: &BucketKey) -> u32 {
    let hash = key
        .raw()
        .chars()
        .fold(0i32, |hash, c| hash.wrapping_mul(31).wrapping_add(c as u32 as i32));
    non_negative(hash)
}

/// `i32::MIN` has no positive counterpart, so it is nudged up by one first.
fn non_negative(hash: i32) -> u32 {
    let hash = if hash == i32::MIN { hash + 1 } else { hash };
    hash.unsigned_abs()
}

/// The rate limiter that loads, consumes from and persists token buckets.
///
/// Keys are spread over [`NUM_SHARDS`] mutexes. The whole
/// load → consume → save sequence for a key runs under its shard's lock, so
/// within one process no two sequences for the same key interleave. Keys
/// that share a shard simply wait for each other.
pub struct RateLimiter {
    /// Where buckets are persisted
    store: Arc<dyn BucketStore>,
    /// Clock bound to freshly created buckets
    clock: Arc<dyn Clock>,
    /// Lock stripes
    shards: Vec<Mutex<()>>,
    /// Key to shard hash
    hasher: ShardHasher,
}

impl RateLimiter {
    /// Create a rate limiter over `store` using the system clock.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(())).collect(),
            hasher: string_hash,
        }
    }

    /// Replace the key hash used for shard selection.
    pub fn with_hasher(mut self, hasher: ShardHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Index of the lock guarding `key`.
    pub fn shard_for(&self, key: &BucketKey) -> usize {
        (self.hasher)(key) as usize % NUM_SHARDS
    }

    /// Try to take one token from the bucket for `key`.
    ///
    /// A bucket is created full from `config` when none is stored. The bucket
    /// is written back only when a token was taken; a denied attempt leaves
    /// the stored state and its TTL untouched.
    pub async fn try_consume(
        &self,
        key: &BucketKey,
        config: &BucketConfig,
    ) -> Result<TokenAcquireResult> {
        let shard = self.shard_for(key);
        let _guard = self.shards[shard].lock().await;

        let mut bucket = match self.store.load(key).await? {
            Some(bucket) => bucket,
            None => {
                debug!(
                    key = %key,
                    capacity = config.capacity,
                    refill_amount = config.refill_amount,
                    refill_interval_ms = config.refill_interval_ms,
                    "Creating new token bucket"
                );
                TokenBucket::new(config, self.clock.clone())
            }
        };

        let result = bucket.take_one_token();
        match result {
            TokenAcquireResult::Acquired => {
                self.store.save(key, &bucket).await?;
            }
            TokenAcquireResult::Denied { remaining } => {
                debug!(
                    key = %key,
                    remaining_ms = remaining.as_millis() as u64,
                    "Token bucket drained"
                );
            }
        }

        trace!(
            key = %key,
            shard = shard,
            tokens = bucket.current_tokens(),
            acquired = result.is_acquired(),
            "Consume attempt finished"
        );
        Ok(result)
    }

    /// Read the stored state for `key` without consuming.
    pub async fn inspect(&self, key: &BucketKey) -> Result<Option<Snapshot>> {
        let _guard = self.shards[self.shard_for(key)].lock().await;
        Ok(self.store.load(key).await?.map(|bucket| bucket.snapshot()))
    }

    /// Drop the stored state for `key`, so its next request starts full.
    pub async fn reset(&self, key: &BucketKey) -> Result<()> {
        let _guard = self.shards[self.shard_for(key)].lock().await;
        debug!(key = %key, "Resetting token bucket");
        self.store.clear(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::error::GatekeeperError;
    use crate::ratelimit::ManualClock;
    use crate::store::MemoryBucketStore;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryBucketStore>, RateLimiter) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryBucketStore::new(clock.clone()));
        let limiter = RateLimiter::with_clock(store.clone(), clock.clone());
        (clock, store, limiter)
    }

    #[test]
    fn test_string_hash_is_deterministic() {
        assert_eq!(string_hash(&BucketKey::Global), 1_243_020_381);
        assert_eq!(string_hash(&BucketKey::caller("200.200.200.200")), 71_483_646);
        assert_eq!(string_hash(&BucketKey::caller("")), 0);
    }

    #[test]
    fn test_min_hash_is_normalized() {
        assert_eq!(non_negative(i32::MIN), i32::MAX as u32);
        assert_eq!(non_negative(-5), 5);
        assert_eq!(non_negative(5), 5);
    }

    #[test]
    fn test_shard_for() {
        let (_, _, limiter) = setup();
        assert_eq!(limiter.shard_for(&BucketKey::Global), 81);
        assert_eq!(limiter.shard_for(&BucketKey::caller("10.0.0.1")), 66);

        for i in 0..500 {
            let key = BucketKey::caller(format!("192.168.{}.{}", i / 256, i % 256));
            assert!(limiter.shard_for(&key) < NUM_SHARDS);
        }
    }

    #[tokio::test]
    async fn test_first_consume_creates_and_persists() {
        let (_, store, limiter) = setup();
        let config = BucketConfig::new(10, 1, Duration::from_secs(1));

        let result = limiter.try_consume(&BucketKey::Global, &config).await.unwrap();

        assert!(result.is_acquired());
        let snapshot = limiter.inspect(&BucketKey::Global).await.unwrap().unwrap();
        assert_eq!(snapshot.current_tokens, 9);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_sixth_request_denied() {
        let (_, _, limiter) = setup();
        let config = BucketConfig::new(5, 1, Duration::from_secs(60));
        let key = BucketKey::caller("200.200.200.200");

        for i in 1..=5 {
            let result = limiter.try_consume(&key, &config).await.unwrap();
            assert!(result.is_acquired(), "request {} should be acquired", i);
        }

        match limiter.try_consume(&key, &config).await.unwrap() {
            TokenAcquireResult::Denied { remaining } => assert!(remaining > Duration::ZERO),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_denied_attempt_does_not_write() {
        let (_, store, limiter) = setup();
        let config = BucketConfig::new(1, 1, Duration::from_secs(60));
        let key = BucketKey::caller("10.0.0.1");

        limiter.try_consume(&key, &config).await.unwrap();
        let ttl = store.ttl_of(&key);
        let bytes = store.raw(&key);

        for _ in 0..3 {
            assert!(!limiter.try_consume(&key, &config).await.unwrap().is_acquired());
        }

        assert_eq!(store.writes(), 1);
        assert_eq!(store.ttl_of(&key), ttl);
        assert_eq!(store.raw(&key), bytes);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_, _, limiter) = setup();
        let config = BucketConfig::new(1, 1, Duration::from_secs(60));

        assert!(limiter.try_consume(&BucketKey::caller("a"), &config).await.unwrap().is_acquired());
        assert!(limiter.try_consume(&BucketKey::caller("b"), &config).await.unwrap().is_acquired());
        assert!(!limiter.try_consume(&BucketKey::caller("a"), &config).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_refill_after_time_passes() {
        let (clock, _, limiter) = setup();
        let config = BucketConfig::new(1, 1, Duration::from_secs(10));
        let key = BucketKey::caller("10.0.0.1");

        assert!(limiter.try_consume(&key, &config).await.unwrap().is_acquired());
        assert!(!limiter.try_consume(&key, &config).await.unwrap().is_acquired());

        clock.advance(Duration::from_secs(10));
        assert!(limiter.try_consume(&key, &config).await.unwrap().is_acquired());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_consumption_has_no_lost_updates() {
        let (_, _, limiter) = setup();
        let limiter = Arc::new(limiter);
        let config = BucketConfig::new(2000, 2, Duration::from_secs(1));

        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_consume(&BucketKey::Global, &config).await })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap().unwrap().is_acquired());
        }

        let snapshot = limiter.inspect(&BucketKey::Global).await.unwrap().unwrap();
        assert_eq!(snapshot.current_tokens, 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_colliding_keys_serialize_correctly() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryBucketStore::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::with_clock(store, clock).with_hasher(|_| 7));
        let config = BucketConfig::new(500, 1, Duration::from_secs(1));

        let tasks: Vec<_> = (0..400)
            .map(|i| {
                let limiter = limiter.clone();
                let key = if i % 2 == 0 {
                    BucketKey::caller("10.0.0.1")
                } else {
                    BucketKey::caller("10.0.0.2")
                };
                tokio::spawn(async move { limiter.try_consume(&key, &config).await })
            })
            .collect();
        futures::future::join_all(tasks).await;

        for address in ["10.0.0.1", "10.0.0.2"] {
            let snapshot = limiter.inspect(&BucketKey::caller(address)).await.unwrap().unwrap();
            assert_eq!(snapshot.current_tokens, 300);
        }
    }

    #[tokio::test]
    async fn test_undecodable_state_fails_loudly() {
        let (_, store, limiter) = setup();
        let key = BucketKey::caller("10.0.0.1");
        store.put_raw(&key, vec![0xFF, 0xFF], Duration::from_secs(60));

        let err = limiter
            .try_consume(&key, &BucketConfig::new(5, 1, Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatekeeperError::Codec(CodecError::UnknownVersion(0xFF))
        ));
        assert_eq!(store.raw(&key), Some(vec![0xFF, 0xFF]));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_reset_starts_bucket_over() {
        let (_, _, limiter) = setup();
        let config = BucketConfig::new(1, 1, Duration::from_secs(60));
        let key = BucketKey::caller("10.0.0.1");

        limiter.try_consume(&key, &config).await.unwrap();
        assert!(!limiter.try_consume(&key, &config).await.unwrap().is_acquired());

        limiter.reset(&key).await.unwrap();
        assert!(limiter.inspect(&key).await.unwrap().is_none());
        assert!(limiter.try_consume(&key, &config).await.unwrap().is_acquired());
    }
}
