//! Token buckets, lock-striped consumption and request admission.

mod admission;
mod bucket;
mod clock;
mod key;
mod limiter;

pub use admission::{Admission, RejectionCounts, RejectionStats, Verdict};
pub use bucket::{Snapshot, TokenAcquireResult, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{BucketKey, ScopeClass};
pub use limiter::{string_hash, RateLimiter, ShardHasher, NUM_SHARDS};
