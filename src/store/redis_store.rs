//! Redis-backed bucket store.

use async_trait::async_trait;
use deadpool_redis::{Pool, PoolConfig, Runtime};
use redis::{Cmd, FromRedisValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::backend::BucketStore;
use super::entry_ttl;
use crate::codec::SnapshotCodec;
use crate::config::StoreConfig;
use crate::error::{GatekeeperError, Result};

/// Response timeout used by [`RedisBucketStore::from_pool`].
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
use crate::ratelimit::{BucketKey, Clock, TokenBucket};

/// A bucket store that keeps encoded snapshots in Redis.
///
/// Every operation checks a connection out of the pool for its own duration
/// only; the connection goes back to the pool when the guard drops, on
/// success and on error alike. Checkout plus command is bounded by the
/// response timeout, since the caller holds a shard lock meanwhile.
pub struct RedisBucketStore {
    pool: Pool,
    codec: Arc<dyn SnapshotCodec>,
    clock: Arc<dyn Clock>,
    ttl_ceiling: Duration,
    response_timeout: Duration,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("pool", &self.pool.status())
            .field("ttl_ceiling", &self.ttl_ceiling)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl RedisBucketStore {
    /// Build a connection pool from configuration and check the server answers.
    pub async fn connect(
        config: &StoreConfig,
        codec: Arc<dyn SnapshotCodec>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!(
            redis_url = %config.redis_url,
            pool_size = config.pool_size,
            "Connecting bucket store"
        );

        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.pool_wait_timeout());
        pool_config.timeouts.create = Some(config.pool_wait_timeout());

        let mut redis_config = deadpool_redis::Config::from_url(config.redis_url.clone());
        redis_config.pool = Some(pool_config);
        let pool = redis_config.create_pool(Some(Runtime::Tokio1))?;

        let store = Self::from_pool(pool, codec, clock, config.full_bucket_expiration())
            .with_response_timeout(config.response_timeout());
        store.ping().await.map_err(|e| {
            error!(error = %e, "Bucket store is not reachable");
            e
        })?;

        debug!("Bucket store connected");
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(
        pool: Pool,
        codec: Arc<dyn SnapshotCodec>,
        clock: Arc<dyn Clock>,
        ttl_ceiling: Duration,
    ) -> Self {
        Self {
            pool,
            codec,
            clock,
            ttl_ceiling,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Bound the time a checkout plus one command may take.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Run one command on a pooled connection within the response timeout.
    async fn query<T: FromRedisValue + Send>(&self, cmd: &Cmd) -> Result<T> {
        let round_trip = async {
            let mut conn = self.pool.get().await?;
            let value = cmd.query_async::<T>(&mut conn).await?;
            Ok::<T, GatekeeperError>(value)
        };

        match tokio::time::timeout(self.response_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    timeout_ms = self.response_timeout.as_millis() as u64,
                    "Bucket store did not respond"
                );
                Err(GatekeeperError::Timeout(self.response_timeout))
            }
        }
    }

    /// Round-trip a `PING` through a pooled connection.
    pub async fn ping(&self) -> Result<()> {
        self.query::<String>(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Remaining TTL of the entry under `key`, if it exists and expires.
    pub async fn ttl_of(&self, key: &BucketKey) -> Result<Option<Duration>> {
        let millis: i64 = self.query(redis::cmd("PTTL").arg(key.raw())).await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn load(&self, key: &BucketKey) -> Result<Option<TokenBucket>> {
        let bytes: Option<Vec<u8>> = self.query(redis::cmd("GET").arg(key.raw())).await?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let snapshot = self.codec.decode(&bytes).map_err(|e| {
            error!(key = %key, error = %e, "Stored bucket could not be decoded");
            e
        })?;
        Ok(Some(TokenBucket::from_snapshot(snapshot, self.clock.clone())))
    }

    async fn save(&self, key: &BucketKey, bucket: &TokenBucket) -> Result<()> {
        let payload = self.codec.encode(&bucket.snapshot())?;
        let ttl = entry_ttl(bucket, self.ttl_ceiling);

        self.query::<()>(
            redis::cmd("SET")
                .arg(key.raw())
                .arg(&payload[..])
                .arg("PX")
                .arg(ttl.as_millis() as u64),
        )
        .await?;

        debug!(
            key = %key,
            tokens = bucket.current_tokens(),
            ttl_ms = ttl.as_millis() as u64,
            "Saved bucket"
        );
        Ok(())
    }

    async fn clear(&self, key: &BucketKey) -> Result<()> {
        let deleted: i64 = self.query(redis::cmd("DEL").arg(key.raw())).await?;

        if deleted > 0 {
            debug!(key = %key, "Cleared bucket");
        } else {
            debug!(key = %key, "No bucket to clear");
        }
        Ok(())
    }
}
