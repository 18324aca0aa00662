//! Configuration management for coordkit.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoordkitError, Result};

/// Prefix for environment overrides, e.g. `COORDKIT__STORE__URL`.
const ENV_PREFIX: &str = "COORDKIT";

/// Main configuration for the coordination primitives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordkitConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Request quota configuration
    #[serde(default)]
    pub period_limit: PeriodLimitConfig,

    /// In-process cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Distributed lock configuration
    #[serde(default)]
    pub lock: LockConfig,
}

/// Shared key-value store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL of the redis server
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Deadline for a single store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            timeout_ms: default_store_timeout(),
        }
    }
}

impl StoreConfig {
    /// Per-call deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout() -> u64 {
    1000
}

/// Request quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodLimitConfig {
    /// Whether admission control is active at all
    #[serde(default)]
    pub enable: bool,

    /// Count in the shared store instead of in process memory
    #[serde(default)]
    pub distributed: bool,

    /// Window length in seconds
    #[serde(default = "default_period")]
    pub period: u64,

    /// Maximum requests per window
    #[serde(default = "default_quota")]
    pub quota: u64,

    /// Align windows to local-time boundaries of `period`
    #[serde(default)]
    pub align: bool,

    /// Prefix for counter keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for PeriodLimitConfig {
    fn default() -> Self {
        Self {
            enable: false,
            distributed: false,
            period: default_period(),
            quota: default_quota(),
            align: false,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_period() -> u64 {
    1
}

fn default_quota() -> u64 {
    100
}

fn default_key_prefix() -> String {
    "REST_PERIOD_LIMIT".to_string()
}

/// In-process cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Hold duration used when a caller does not pick one
    #[serde(default = "default_lock_ttl")]
    pub default_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_lock_ttl(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    10
}

impl CoordkitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CoordkitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| CoordkitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply
    /// `COORDKIT__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        let config: CoordkitConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no primitive can run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(CoordkitError::Config("store.timeout_ms must be positive".into()));
        }
        if self.period_limit.period == 0 {
            return Err(CoordkitError::Config("period_limit.period must be positive".into()));
        }
        if self.period_limit.quota == 0 {
            return Err(CoordkitError::Config("period_limit.quota must be positive".into()));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(CoordkitError::Config(
                "cache.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.lock.default_ttl_secs == 0 {
            return Err(CoordkitError::Config("lock.default_ttl_secs must be positive".into()));
        }
        Ok(())
    }
}
