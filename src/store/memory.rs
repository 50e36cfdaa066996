//! In-process bucket store.
//!
//! Holds encoded payloads in a `DashMap`, with expiry evaluated against the
//! injected clock. Expired entries are evicted on load and swept on every
//! save, so the map only holds live buckets plus whatever expired since the
//! last write. Used by tests and single-instance development setups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::backend::BucketStore;
use super::{entry_ttl, DEFAULT_TTL_CEILING};
use crate::codec::{SnapshotCodec, VersionedCodec};
use crate::error::Result;
use crate::ratelimit::{BucketKey, Clock, TokenBucket};

struct MemoryEntry {
    bytes: Vec<u8>,
    ttl: Duration,
    expires_at: DateTime<Utc>,
}

/// A bucket store backed by a concurrent hash map.
pub struct MemoryBucketStore {
    entries: DashMap<String, MemoryEntry>,
    codec: Arc<dyn SnapshotCodec>,
    clock: Arc<dyn Clock>,
    ttl_ceiling: Duration,
    /// Number of successful saves
    writes: AtomicU64,
}

impl MemoryBucketStore {
    /// Create an empty store using the standard codec.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_codec(Arc::new(VersionedCodec::standard()), clock)
    }

    /// Create an empty store with a specific codec.
    pub fn with_codec(codec: Arc<dyn SnapshotCodec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            codec,
            clock,
            ttl_ceiling: DEFAULT_TTL_CEILING,
            writes: AtomicU64::new(0),
        }
    }

    /// Bound the TTL of stored entries.
    pub fn with_ttl_ceiling(mut self, ceiling: Duration) -> Self {
        self.ttl_ceiling = ceiling;
        self
    }

    /// The TTL the entry under `key` was last written with.
    pub fn ttl_of(&self, key: &BucketKey) -> Option<Duration> {
        self.entries.get(key.raw()).map(|entry| entry.ttl)
    }

    /// Raw payload stored under `key`, expired or not.
    pub fn raw(&self, key: &BucketKey) -> Option<Vec<u8>> {
        self.entries.get(key.raw()).map(|entry| entry.bytes.clone())
    }

    /// Store bytes as-is, bypassing the codec.
    pub fn put_raw(&self, key: &BucketKey, bytes: Vec<u8>, ttl: Duration) {
        let expires_at = expiry(self.clock.now(), ttl);
        self.entries.insert(
            key.raw().to_string(),
            MemoryEntry {
                bytes,
                ttl,
                expires_at,
            },
        );
    }

    /// Drop every entry whose TTL has lapsed, returning how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            trace!(purged = purged, "Swept expired buckets");
        }
        purged
    }

    /// Number of saves performed so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of entries held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn load(&self, key: &BucketKey) -> Result<Option<TokenBucket>> {
        let now = self.clock.now();

        // The map guard must be dropped before evicting.
        let live = self
            .entries
            .get(key.raw())
            .map(|entry| (entry.expires_at > now).then(|| entry.bytes.clone()));

        let bytes = match live {
            None => return Ok(None),
            Some(None) => {
                trace!(key = %key, "Evicting expired bucket");
                self.entries
                    .remove_if(key.raw(), |_, entry| entry.expires_at <= now);
                return Ok(None);
            }
            Some(Some(bytes)) => bytes,
        };

        let snapshot = self.codec.decode(&bytes)?;
        Ok(Some(TokenBucket::from_snapshot(snapshot, self.clock.clone())))
    }

    async fn save(&self, key: &BucketKey, bucket: &TokenBucket) -> Result<()> {
        let bytes = self.codec.encode(&bucket.snapshot())?;
        let ttl = entry_ttl(bucket, self.ttl_ceiling);
        self.purge_expired();
        self.put_raw(key, bytes, ttl);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, key: &BucketKey) -> Result<()> {
        self.entries.remove(key.raw());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BinaryFormat, CodecError, GzipJsonFormat};
    use crate::config::BucketConfig;
    use crate::error::GatekeeperError;
    use crate::ratelimit::ManualClock;

    fn setup() -> (Arc<ManualClock>, MemoryBucketStore) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryBucketStore::new(clock.clone());
        (clock, store)
    }

    fn drained_bucket(clock: Arc<ManualClock>) -> TokenBucket {
        let mut bucket = TokenBucket::new(&BucketConfig::new(100, 10, Duration::from_secs(100)), clock);
        bucket.take_one_token();
        bucket
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let (_, store) = setup();
        let loaded = tokio_test::assert_ok!(store.load(&BucketKey::Global).await);
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (clock, store) = setup();
        let key = BucketKey::caller("10.0.0.1");
        let bucket = drained_bucket(clock);

        store.save(&key, &bucket).await.unwrap();
        let loaded = store.load(&key).await.unwrap().unwrap();

        assert_eq!(loaded.snapshot(), bucket.snapshot());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_ttl_equals_time_to_full() {
        let (clock, store) = setup();
        let key = BucketKey::Global;
        let mut bucket = drained_bucket(clock);

        store.save(&key, &bucket).await.unwrap();
        assert_eq!(store.ttl_of(&key), Some(Duration::from_secs(100)));

        for _ in 0..20 {
            bucket.take_one_token();
        }
        store.save(&key, &bucket).await.unwrap();
        assert_eq!(store.ttl_of(&key), Some(bucket.time_to_full()));
        assert_eq!(store.ttl_of(&key), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_ttl_ceiling() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryBucketStore::new(clock.clone()).with_ttl_ceiling(Duration::from_secs(10));
        let key = BucketKey::Global;

        store.save(&key, &drained_bucket(clock)).await.unwrap();

        assert_eq!(store.ttl_of(&key), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let (clock, store) = setup();
        let key = BucketKey::caller("10.0.0.1");
        store.save(&key, &drained_bucket(clock.clone())).await.unwrap();

        clock.advance(Duration::from_secs(99));
        assert!(store.load(&key).await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.load(&key).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_sweeps_other_expired_entries() {
        let (clock, store) = setup();
        let stale: Vec<BucketKey> = (0..50)
            .map(|i| BucketKey::caller(format!("10.0.1.{}", i)))
            .collect();
        for key in &stale {
            store.save(key, &drained_bucket(clock.clone())).await.unwrap();
        }
        assert_eq!(store.len(), 50);

        clock.advance(Duration::from_secs(100));
        let fresh = BucketKey::caller("10.0.2.1");
        store.save(&fresh, &drained_bucket(clock.clone())).await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(stale.iter().all(|key| store.raw(key).is_none()));
        assert!(store.raw(&fresh).is_some());
    }

    #[tokio::test]
    async fn test_purge_keeps_live_entries() {
        let (clock, store) = setup();
        let short = BucketKey::caller("10.0.0.1");
        let long = BucketKey::caller("10.0.0.2");
        store.put_raw(&short, vec![1], Duration::from_secs(10));
        store.put_raw(&long, vec![2], Duration::from_secs(60));

        clock.advance(Duration::from_secs(30));

        assert_eq!(store.purge_expired(), 1);
        assert!(store.raw(&short).is_none());
        assert_eq!(store.raw(&long), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_clear() {
        let (clock, store) = setup();
        let key = BucketKey::caller("10.0.0.1");
        store.save(&key, &drained_bucket(clock)).await.unwrap();

        store.clear(&key).await.unwrap();
        store.clear(&key).await.unwrap();

        assert!(store.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loaded_bucket_uses_store_clock() {
        let (clock, store) = setup();
        let key = BucketKey::caller("10.0.0.1");
        let mut bucket = TokenBucket::new(&BucketConfig::new(1, 1, Duration::from_secs(5)), clock.clone());
        bucket.take_one_token();
        store.save(&key, &bucket).await.unwrap();

        clock.advance(Duration::from_secs(5));
        let mut loaded = store.load(&key).await.unwrap().unwrap();

        assert!(loaded.take_one_token().is_acquired());
    }

    #[tokio::test]
    async fn test_unknown_version_fails_loudly() {
        let (_, store) = setup();
        let key = BucketKey::caller("10.0.0.1");
        store.put_raw(&key, vec![0x42, 0, 0, 0], Duration::from_secs(60));

        let err = store.load(&key).await.unwrap_err();

        assert!(matches!(
            err,
            GatekeeperError::Codec(CodecError::UnknownVersion(0x42))
        ));
    }

    #[tokio::test]
    async fn test_reads_entries_written_by_legacy_codec() {
        let clock = Arc::new(ManualClock::default());
        let legacy = MemoryBucketStore::with_codec(
            Arc::new(VersionedCodec::new(Box::new(GzipJsonFormat))),
            clock.clone(),
        );
        let key = BucketKey::Global;
        let bucket = drained_bucket(clock.clone());
        legacy.save(&key, &bucket).await.unwrap();

        let current = MemoryBucketStore::with_codec(
            Arc::new(VersionedCodec::new(Box::new(BinaryFormat)).register(Box::new(GzipJsonFormat))),
            clock,
        );
        current.put_raw(&key, legacy.raw(&key).unwrap(), Duration::from_secs(100));

        let loaded = current.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot(), bucket.snapshot());
    }
}
