//! Configuration management for Windowgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    BackoffPolicy, DistributedLimiter, LocalLimiter, LocalOptions, Quota, RateLimiter,
    SystemClock, TimeWindow, DEFAULT_KEY_PREFIX, DEFAULT_RETRY_BUDGET,
};
use crate::store::MemoryStore;

/// Prefix for environment overrides, e.g. `WINDOWGATE__CAPACITY=50`.
pub const ENV_PREFIX: &str = "WINDOWGATE";

/// Settings for one rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum units admitted per window
    pub capacity: u64,

    /// Window length in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,

    /// Named window length, alternative to `window_ms`
    #[serde(default)]
    pub unit: Option<TimeWindow>,

    /// Which store keeps the window state
    #[serde(default)]
    pub backend: BackendSettings,

    /// Backoff used by `wait`
    #[serde(default)]
    pub wait: WaitSettings,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            window_ms: Some(1000),
            unit: None,
            backend: BackendSettings::default(),
            wait: WaitSettings::default(),
        }
    }
}

/// Backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSettings {
    /// In-process store
    Local {
        /// CAS attempts per call
        #[serde(default = "default_retry_budget")]
        retry_budget: u32,
        /// Idle key sweep interval; zero disables the sweeper
        #[serde(default = "default_sweep_interval_ms")]
        sweep_interval_ms: u64,
    },

    /// Shared store kept in this process, for tests and single-host fleets
    Memory {
        /// Key namespace
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },

    /// Redis shared store
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1/`
        url: String,
        /// Key namespace
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::Local {
            retry_budget: default_retry_budget(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Wait backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitSettings {
    /// Shortest sleep between attempts
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Longest sleep between attempts
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Randomize sleeps
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_min_backoff_ms() -> u64 {
    5
}

fn default_max_backoff_ms() -> u64 {
    1000
}

fn default_jitter() -> bool {
    true
}

impl LimiterSettings {
    /// Parse settings from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load settings from a YAML file, overridden by `WINDOWGATE__*`
    /// environment variables (`__` separates nested keys, e.g.
    /// `WINDOWGATE__BACKEND__KIND=redis`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| LimiterError::Config(format!("{}: {}", path.display(), e)))
    }

    /// The validated quota.
    pub fn quota(&self) -> Result<Quota> {
        match (self.window_ms, self.unit) {
            (Some(window_ms), None) => Quota::new(self.capacity, Duration::from_millis(window_ms)),
            (None, Some(unit)) => Quota::per(self.capacity, unit),
            (Some(_), Some(_)) => Err(LimiterError::Config(
                "set either window_ms or unit, not both".to_string(),
            )),
            (None, None) => Err(LimiterError::Config(
                "one of window_ms or unit is required".to_string(),
            )),
        }
    }

    /// Backoff policy for `wait`.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            min_backoff: Duration::from_millis(self.wait.min_backoff_ms),
            max_backoff: Duration::from_millis(self.wait.max_backoff_ms),
            jitter: self.wait.jitter,
        }
    }

    /// Idle key sweep interval, if the backend has one.
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.backend {
            BackendSettings::Local {
                sweep_interval_ms, ..
            } if sweep_interval_ms > 0 => Some(Duration::from_millis(sweep_interval_ms)),
            _ => None,
        }
    }

    /// Build the configured rate limiter.
    ///
    /// Distributed backends connect to their store and announce the quota,
    /// failing if another process already uses the prefix with a different one.
    pub async fn build(&self) -> Result<RateLimiter> {
        let quota = self.quota()?;

        let limiter: RateLimiter = match &self.backend {
            BackendSettings::Local { retry_budget, .. } => LocalLimiter::with_options(
                quota,
                LocalOptions {
                    retry_budget: *retry_budget,
                },
                Arc::new(SystemClock::new()),
            )?
            .into(),
            BackendSettings::Memory { key_prefix } => {
                let limiter =
                    DistributedLimiter::with_prefix(quota, Arc::new(MemoryStore::new()), key_prefix.clone())?;
                limiter.announce_quota().await?;
                limiter.into()
            }
            #[cfg(feature = "redis")]
            BackendSettings::Redis { url, key_prefix } => {
                let store = crate::store::RedisStore::connect(url).await?;
                let limiter = DistributedLimiter::with_prefix(quota, Arc::new(store), key_prefix.clone())?;
                limiter.announce_quota().await?;
                limiter.into()
            }
            #[cfg(not(feature = "redis"))]
            BackendSettings::Redis { .. } => {
                return Err(LimiterError::Config(
                    "redis backend requires the `redis` feature".to_string(),
                ));
            }
        };

        info!(
            backend = limiter.backend_name(),
            capacity = quota.capacity(),
            window_ms = quota.window_ms(),
            "Rate limiter initialized"
        );
        Ok(limiter)
    }
}
