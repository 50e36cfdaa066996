//! Admission checks for chargeable requests.
//!
//! Every chargeable request is checked against the caller's own bucket and
//! then the global bucket. The request is let through only if both checks
//! take a token; the first denial stops the sequence, so a request throttled
//! per caller never drains the global bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::bucket::TokenAcquireResult;
use super::key::{BucketKey, ScopeClass};
use super::limiter::RateLimiter;
use crate::config::{BucketConfig, FailurePolicy, LimitsConfig};
use crate::error::Result;

/// Decision for one chargeable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Both buckets had a token
    Allowed,
    /// No caller address was supplied; nothing was consumed
    MissingAddress,
    /// A bucket was empty
    Throttled {
        scope: ScopeClass,
        retry_after: Duration,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    /// Whole seconds for a `Retry-After` hint, rounded up and at least one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Verdict::Throttled { retry_after, .. } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Some(secs.max(1))
            }
            _ => None,
        }
    }
}

/// Counters of rejected (or leniently admitted) requests by reason.
#[derive(Debug, Default)]
pub struct RejectionStats {
    missing_address: AtomicU64,
    per_caller: AtomicU64,
    global: AtomicU64,
    store_failures: AtomicU64,
}

/// Point-in-time copy of [`RejectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectionCounts {
    pub missing_address: u64,
    pub per_caller: u64,
    pub global: u64,
    /// Checks let through under [`FailurePolicy::Open`]
    pub store_failures: u64,
}

impl RejectionStats {
    pub fn counts(&self) -> RejectionCounts {
        RejectionCounts {
            missing_address: self.missing_address.load(Ordering::Relaxed),
            per_caller: self.per_caller.load(Ordering::Relaxed),
            global: self.global.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }

    fn record_throttled(&self, scope: ScopeClass) {
        let counter = match scope {
            ScopeClass::PerCaller => &self.per_caller,
            ScopeClass::Global => &self.global,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs the per-caller and global checks for chargeable requests.
pub struct Admission {
    limiter: Arc<RateLimiter>,
    limits: LimitsConfig,
    stats: RejectionStats,
}

impl Admission {
    pub fn new(limiter: Arc<RateLimiter>, limits: LimitsConfig) -> Self {
        Self {
            limiter,
            limits,
            stats: RejectionStats::default(),
        }
    }

    pub fn stats(&self) -> RejectionCounts {
        self.stats.counts()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Decide whether a request from `caller` may proceed.
    ///
    /// `caller` is the address taken from the trusted proxy header; `None`
    /// or an empty value is rejected before any bucket is touched.
    #[instrument(skip(self), fields(caller = ?caller))]
    pub async fn admit(&self, caller: Option<&str>) -> Result<Verdict> {
        let Some(address) = caller.map(str::trim).filter(|a| !a.is_empty()) else {
            warn!("Rejected request because there was no caller address");
            self.stats.missing_address.fetch_add(1, Ordering::Relaxed);
            return Ok(Verdict::MissingAddress);
        };

        let checks = [
            (BucketKey::caller(address), &self.limits.per_caller),
            (BucketKey::Global, &self.limits.global),
        ];

        for (key, config) in &checks {
            if let TokenAcquireResult::Denied { remaining } = self.check(key, config).await? {
                let scope = key.class();
                warn!(
                    scope = %scope,
                    retry_after_ms = remaining.as_millis() as u64,
                    "Rejected request because the bucket was drained"
                );
                self.stats.record_throttled(scope);
                return Ok(Verdict::Throttled {
                    scope,
                    retry_after: remaining,
                });
            }
        }

        debug!("Request admitted");
        Ok(Verdict::Allowed)
    }

    /// One check, with the store failure policy applied.
    async fn check(&self, key: &BucketKey, config: &BucketConfig) -> Result<TokenAcquireResult> {
        match self.limiter.try_consume(key, config).await {
            Err(e)
                if e.is_store_unavailable()
                    && self.limits.failure_policy == FailurePolicy::Open =>
            {
                warn!(key = %key, error = %e, "Bucket store unavailable, admitting request");
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                Ok(TokenAcquireResult::Acquired)
            }
            other => other,
        }
    }
}
