//! Token bucket implementation.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use crate::config::BucketConfig;

/// Outcome of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAcquireResult {
    /// A token was taken
    Acquired,
    /// The bucket was empty
    Denied {
        /// Time until the next refill event
        remaining: Duration,
    },
}

impl TokenAcquireResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, TokenAcquireResult::Acquired)
    }
}

/// Immutable copy of a bucket's state, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub capacity: u64,
    pub refill_period: Duration,
    pub refill_amount: u64,
    pub last_refill_at: DateTime<Utc>,
    pub current_tokens: u64,
}

/// A token bucket bound to a clock.
///
/// A bucket starts full, loses one token per allowed action and regains
/// `refill_amount` tokens every `refill_period`, never exceeding `capacity`.
/// Instances are short-lived: the limiter loads one, consumes from it and
/// writes it back while holding the shard lock for its key.
pub struct TokenBucket {
    capacity: u64,
    refill_period: Duration,
    refill_amount: u64,
    last_refill_at: DateTime<Utc>,
    current_tokens: u64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_period", &self.refill_period)
            .field("refill_amount", &self.refill_amount)
            .field("last_refill_at", &self.last_refill_at)
            .field("current_tokens", &self.current_tokens)
            .finish()
    }
}

impl TokenBucket {
    /// Create a full bucket from a configuration.
    pub fn new(config: &BucketConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: config.capacity,
            refill_period: config.refill_interval(),
            refill_amount: config.refill_amount,
            last_refill_at: clock.now(),
            current_tokens: config.capacity,
            clock,
        }
    }

    /// Rebuild a bucket from persisted state, bound to this process's clock.
    pub fn from_snapshot(snapshot: Snapshot, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: snapshot.capacity,
            refill_period: snapshot.refill_period,
            refill_amount: snapshot.refill_amount,
            last_refill_at: snapshot.last_refill_at,
            current_tokens: snapshot.current_tokens.min(snapshot.capacity),
            clock,
        }
    }

    /// Capture the current state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            capacity: self.capacity,
            refill_period: self.refill_period,
            refill_amount: self.refill_amount,
            last_refill_at: self.last_refill_at,
            current_tokens: self.current_tokens,
        }
    }

    /// Refill if due, then try to take one token.
    pub fn take_one_token(&mut self) -> TokenAcquireResult {
        let now = self.clock.now();
        self.refill(now);

        if self.current_tokens == 0 {
            return TokenAcquireResult::Denied {
                remaining: self.time_to_next_refill(now),
            };
        }

        self.current_tokens -= 1;
        TokenAcquireResult::Acquired
    }

    /// Time needed to get back to capacity from the current level, in whole
    /// refill periods.
    pub fn time_to_full(&self) -> Duration {
        let missing = self.capacity.saturating_sub(self.current_tokens);
        let ticks = missing.div_ceil(self.refill_amount.max(1));
        self.refill_period
            .saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn current_tokens(&self) -> u64 {
        self.current_tokens
    }

    pub fn last_refill_at(&self) -> DateTime<Utc> {
        self.last_refill_at
    }

    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    pub fn refill_amount(&self) -> u64 {
        self.refill_amount
    }

    /// Add one `refill_amount` per whole period elapsed since the last refill
    /// and move `last_refill_at` forward by those periods.
    fn refill(&mut self, now: DateTime<Utc>) {
        if self.refill_period.is_zero() {
            self.current_tokens = self.capacity;
            self.last_refill_at = now;
            return;
        }

        // Negative when the clock is behind the stored timestamp.
        let elapsed = match (now - self.last_refill_at).to_std() {
            Ok(elapsed) => elapsed,
            Err(_) => return,
        };
        if elapsed < self.refill_period {
            return;
        }

        let periods = elapsed.as_nanos() / self.refill_period.as_nanos();
        let added = u64::try_from(periods)
            .unwrap_or(u64::MAX)
            .saturating_mul(self.refill_amount);
        self.current_tokens = self.current_tokens.saturating_add(added).min(self.capacity);

        let advanced = u64::try_from(periods * self.refill_period.as_nanos())
            .ok()
            .and_then(|nanos| chrono::Duration::from_std(Duration::from_nanos(nanos)).ok())
            .and_then(|delta| self.last_refill_at.checked_add_signed(delta));
        self.last_refill_at = advanced.unwrap_or(now);
    }

    fn time_to_next_refill(&self, now: DateTime<Utc>) -> Duration {
        chrono::Duration::from_std(self.refill_period)
            .ok()
            .and_then(|period| self.last_refill_at.checked_add_signed(period))
            .and_then(|deadline| (deadline - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}
