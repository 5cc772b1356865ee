//! Distributed rate limiter backed by a shared store.
//!
//! Every process pointing at the same store and key prefix shares quota.
//! Each admission is exactly one [`WindowTransaction::Admit`] round trip, so
//! two processes racing on a key can never both be admitted past capacity.
//!
//! The admission log is exact: every admitted batch is recorded with its
//! timestamp and ages out on its own, at the cost of memory proportional to
//! the number of admissions inside one window.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::{check_units, Limiter};
use super::window::{self, Quota, QuotaSnapshot};
use crate::error::{LimiterError, Result};
use crate::store::{SharedStore, WindowOutcome, WindowTransaction};

/// Default namespace for keys written to the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "windowgate";

/// How long an announced quota stays visible to other processes.
const ANNOUNCE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Store keys holding one limiter key's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKeys {
    /// Sorted admission log
    pub log: String,
    /// Sequence counter naming log entries
    pub seq: String,
}

/// A rate limiter whose state lives in a [`SharedStore`].
#[derive(Debug, Clone)]
pub struct DistributedLimiter {
    store: Arc<dyn SharedStore>,
    quota: Quota,
    prefix: String,
}

impl DistributedLimiter {
    /// Create a distributed limiter using the default key prefix.
    pub fn new(quota: Quota, store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            quota,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Create a distributed limiter under a custom key prefix.
    pub fn with_prefix(quota: Quota, store: Arc<dyn SharedStore>, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(LimiterError::Config("key prefix must not be empty".to_string()));
        }
        Ok(Self {
            store,
            quota,
            prefix,
        })
    }

    /// The configured quota.
    pub fn limits(&self) -> Quota {
        self.quota
    }

    /// The key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store keys used for `key`.
    ///
    /// Format: `<prefix>:{<key>}:log` and `<prefix>:{<key>}:seq`. The braces
    /// are a Redis Cluster hash tag, so both keys of one transaction hash to
    /// the same slot. All processes sharing quota must agree on this layout.
    pub fn record_keys(&self, key: &str) -> RecordKeys {
        RecordKeys {
            log: format!("{}:{{{}}}:log", self.prefix, key),
            seq: format!("{}:{{{}}}:seq", self.prefix, key),
        }
    }

    fn quota_key(&self) -> String {
        format!("{}:quota", self.prefix)
    }

    fn quota_fingerprint(&self) -> String {
        format!("{}:{}", self.quota.capacity(), self.quota.window_ms())
    }

    async fn run(&self, key: &str, tx: WindowTransaction) -> Result<WindowOutcome> {
        self.store.execute(tx).await.map_err(|e| {
            warn!(key = %key, error = %e, "Shared store transaction failed");
            LimiterError::Store(e)
        })
    }

    /// Try to admit `n` units for `key`.
    pub async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        check_units(n)?;
        let capacity = self.quota.capacity();
        if n > capacity {
            trace!(key = %key, hits = n, capacity, "Request larger than capacity");
            return Ok(false);
        }

        let keys = self.record_keys(key);
        trace!(key = %key, hits = n, "Checking distributed rate limit");

        let outcome = self
            .run(
                key,
                WindowTransaction::Admit {
                    log_key: keys.log,
                    seq_key: keys.seq,
                    window_ms: self.quota.window_ms(),
                    capacity,
                    units: n,
                },
            )
            .await?;

        if !outcome.admitted {
            debug!(
                key = %key,
                hits = n,
                count = outcome.count,
                capacity,
                "Distributed rate limit exceeded"
            );
        }
        Ok(outcome.admitted)
    }

    /// Try to admit a single unit for `key`.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        self.allow_n(key, 1).await
    }

    /// Quota view for `key`.
    pub async fn quota(&self, key: &str) -> Result<QuotaSnapshot> {
        let window_ms = self.quota.window_ms();
        let outcome = self
            .run(
                key,
                WindowTransaction::Inspect {
                    log_key: self.record_keys(key).log,
                    window_ms,
                },
            )
            .await?;

        let reset_after = match outcome.oldest_ms {
            Some(oldest_ms) if outcome.count > 0 => {
                Duration::from_millis(window::expires_in_ms(oldest_ms, outcome.now_ms, window_ms))
            }
            _ => Duration::ZERO,
        };

        let capacity = self.quota.capacity();
        Ok(QuotaSnapshot::new(
            capacity,
            window::remaining(capacity, outcome.count),
            reset_after,
        ))
    }

    /// Units currently available for `key`.
    pub async fn remaining(&self, key: &str) -> Result<u64> {
        Ok(self.quota(key).await?.remaining)
    }

    /// Clear all state for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let keys = self.record_keys(key);
        self.store
            .delete(&[keys.log, keys.seq])
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to reset key");
                LimiterError::Store(e)
            })?;
        debug!(key = %key, "Reset distributed rate limit state");
        Ok(())
    }

    /// Publish this limiter's quota under the prefix, or verify it matches
    /// the quota another process already published.
    ///
    /// Processes sharing a prefix must agree on capacity and window; a
    /// mismatch is reported as a configuration error.
    pub async fn announce_quota(&self) -> Result<()> {
        let key = self.quota_key();
        let ours = self.quota_fingerprint();

        match self.store.get(&key).await? {
            Some(theirs) if theirs != ours => {
                warn!(
                    prefix = %self.prefix,
                    ours = %ours,
                    theirs = %theirs,
                    "Quota disagrees with another process"
                );
                Err(LimiterError::Config(format!(
                    "prefix {} is already used with quota {} (capacity:window_ms), this limiter has {}",
                    self.prefix, theirs, ours
                )))
            }
            _ => {
                self.store.set_with_expiry(&key, &ours, ANNOUNCE_TTL).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Limiter for DistributedLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        DistributedLimiter::allow_n(self, key, n).await
    }

    fn limit(&self) -> u64 {
        self.quota.capacity()
    }

    fn window(&self) -> Duration {
        self.quota.window()
    }

    async fn quota(&self, key: &str) -> Result<QuotaSnapshot> {
        DistributedLimiter::quota(self, key).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        DistributedLimiter::reset(self, key).await
    }
}
