//! Bucket key generation and handling.

use std::hash::{Hash, Hasher};

/// Raw projection of the global scope.
const GLOBAL_RAW_KEY: &str = "global";

/// A key that identifies a rate limit scope.
///
/// The key is either the single global scope shared by every caller, or one
/// scope per caller address. Equality and hashing go through [`raw`](Self::raw).
#[derive(Debug, Clone)]
pub enum BucketKey {
    /// Shared by all callers
    Global,
    /// One scope per caller address
    Caller(String),
}

impl BucketKey {
    /// Create a per-caller key from an address.
    pub fn caller(address: impl Into<String>) -> Self {
        BucketKey::Caller(address.into())
    }

    /// Parse a raw key back into a scope.
    pub fn parse(raw: &str) -> Self {
        if raw == GLOBAL_RAW_KEY {
            BucketKey::Global
        } else {
            BucketKey::Caller(raw.to_string())
        }
    }

    /// The stable string projection used as the store key.
    pub fn raw(&self) -> &str {
        match self {
            BucketKey::Global => GLOBAL_RAW_KEY,
            BucketKey::Caller(address) => address,
        }
    }

    /// The configuration class this key belongs to.
    pub fn class(&self) -> ScopeClass {
        match self {
            BucketKey::Global => ScopeClass::Global,
            BucketKey::Caller(_) => ScopeClass::PerCaller,
        }
    }
}

impl PartialEq for BucketKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
    }
}

impl Eq for BucketKey {}

impl Hash for BucketKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw())
    }
}

/// The two classes of scope, each with its own bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeClass {
    PerCaller,
    Global,
}

impl std::fmt::Display for ScopeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeClass::PerCaller => write!(f, "per-caller"),
            ScopeClass::Global => write!(f, "global"),
        }
    }
}
