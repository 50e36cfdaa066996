//! Configuration management for Gatekeeper.

use config::builder::DefaultState;
use config::{ConfigBuilder, FileFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER__STORE__REDIS_URL`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limits per scope class
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Bucket store (Redis) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long an operation waits for a free pooled connection, in milliseconds
    #[serde(default = "default_pool_wait_timeout")]
    pub pool_wait_timeout_ms: u64,

    /// How long a single store round trip may take, in milliseconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// Upper bound for the TTL of a stored bucket, in seconds
    #[serde(default = "default_full_bucket_expiration")]
    pub full_bucket_expiration_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            pool_size: default_pool_size(),
            pool_wait_timeout_ms: default_pool_wait_timeout(),
            response_timeout_ms: default_response_timeout(),
            full_bucket_expiration_secs: default_full_bucket_expiration(),
        }
    }
}

impl StoreConfig {
    pub fn pool_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_wait_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn full_bucket_expiration(&self) -> Duration {
        Duration::from_secs(self.full_bucket_expiration_secs)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_pool_wait_timeout() -> u64 {
    1000
}

fn default_response_timeout() -> u64 {
    1000
}

fn default_full_bucket_expiration() -> u64 {
    86400
}

/// Capacity and refill policy of one bucket class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum number of tokens held by the bucket
    pub capacity: u64,
    /// Tokens added per refill event
    pub refill_amount: u64,
    /// Time between refill events, in milliseconds
    pub refill_interval_ms: u64,
}

impl BucketConfig {
    /// Create a bucket configuration.
    ///
    /// The interval is kept in whole milliseconds; any sub-millisecond
    /// remainder is truncated.
    pub fn new(capacity: u64, refill_amount: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_amount,
            refill_interval_ms: refill_interval.as_millis() as u64,
        }
    }

    /// Time between refill events.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    fn validate(&self, class: &str) -> Result<()> {
        if self.capacity < 1 {
            return Err(GatekeeperError::Config(format!(
                "{}: capacity must be at least 1",
                class
            )));
        }
        if self.refill_amount < 1 {
            return Err(GatekeeperError::Config(format!(
                "{}: refill_amount must be at least 1",
                class
            )));
        }
        if self.refill_interval_ms < 1 {
            return Err(GatekeeperError::Config(format!(
                "{}: refill_interval_ms must be at least 1",
                class
            )));
        }
        Ok(())
    }
}

/// What to do with a check when the bucket store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Surface the store error to the caller, which rejects the request
    #[default]
    Closed,
    /// Let the request through as if a token had been taken
    Open,
}

/// Limits for both scope classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Limit applied to each caller address
    #[serde(default = "default_per_caller")]
    pub per_caller: BucketConfig,

    /// Limit shared by all callers
    #[serde(default = "default_global")]
    pub global: BucketConfig,

    /// Behaviour when the store is unavailable, applied to both checks
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_caller: default_per_caller(),
            global: default_global(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_per_caller() -> BucketConfig {
    BucketConfig::new(20, 5, Duration::from_secs(60))
}

fn default_global() -> BucketConfig {
    BucketConfig::new(10_000, 1_000, Duration::from_secs(60))
}

/// Builder seeded with [`GatekeeperConfig::default`] as the lowest layer.
fn defaults() -> Result<ConfigBuilder<DefaultState>> {
    let defaults = config::Config::try_from(&GatekeeperConfig::default())
        .map_err(|e| GatekeeperError::Config(e.to_string()))?;
    Ok(config::Config::builder().add_source(defaults))
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file path, over the defaults.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::build(defaults()?.add_source(config::File::new(path, FileFormat::Yaml)))
    }

    /// Parse and validate configuration from a YAML string, over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::build(defaults()?.add_source(config::File::from_str(yaml, FileFormat::Yaml)))
    }

    /// Load configuration from an optional YAML file, overlaid with
    /// `GATEKEEPER__*` environment variables.
    ///
    /// Every source is layered over the defaults, so a single field such as
    /// `GATEKEEPER__LIMITS__PER_CALLER__CAPACITY` can be overridden alone.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&str>, env: config::Environment) -> Result<Self> {
        let mut builder = defaults()?;
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::new(path, FileFormat::Yaml));
        }
        Self::build(builder.add_source(env))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: GatekeeperConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that could never serve a request.
    pub fn validate(&self) -> Result<()> {
        self.limits.per_caller.validate("limits.per_caller")?;
        self.limits.global.validate("limits.global")?;
        if self.store.pool_size < 1 {
            return Err(GatekeeperError::Config(
                "store.pool_size must be at least 1".to_string(),
            ));
        }
        if self.store.response_timeout_ms < 1 {
            return Err(GatekeeperError::Config(
                "store.response_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.store.full_bucket_expiration_secs < 1 {
            return Err(GatekeeperError::Config(
                "store.full_bucket_expiration_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
