//! In-process counter store with lock-free per-key updates.
//!
//! Each key owns a versioned record: an immutable admission log of
//! `(timestamp_ms, units)` entries behind an [`ArcSwap`]. Admission loads
//! the current log, prunes entries that aged out of the window, decides, and
//! commits a new log with one compare-and-swap; a lost race re-reads and
//! retries within a bounded budget. The log pointer is the version token:
//! every commit installs a new allocation, and a retired log marks a record
//! that has been evicted so in-flight updates holding it fail their swap and
//! move to a fresh record.
//!
//! Every unit ages out on its own, so no rolling window ever holds more than
//! the capacity and quota comes back as soon as each batch expires.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backend::{check_units, Limiter};
use super::clock::{millis_since, Clock, SystemClock};
use super::window::{self, Quota, QuotaSnapshot};
use crate::error::{LimiterError, Result};

/// Default number of CAS attempts before reporting contention.
pub const DEFAULT_RETRY_BUDGET: u32 = 64;

/// Admission log for one key, oldest entry first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct WindowLog {
    entries: Vec<(u64, u64)>,
    retired: bool,
}

impl WindowLog {
    fn retired() -> Self {
        Self {
            entries: Vec::new(),
            retired: true,
        }
    }

    /// Entries still inside the window at `now_ms`.
    fn live(&self, now_ms: u64, window_ms: u64) -> &[(u64, u64)] {
        let expired = self
            .entries
            .partition_point(|&(at, _)| window::is_expired(at, now_ms, window_ms));
        &self.entries[expired..]
    }

    fn count(&self, now_ms: u64, window_ms: u64) -> u64 {
        window::log_count(self.live(now_ms, window_ms).iter().copied(), now_ms, window_ms)
    }

    fn is_idle(&self, now_ms: u64, window_ms: u64) -> bool {
        self.live(now_ms, window_ms).is_empty()
    }

    /// The log after admitting `n` units at `now_ms`, with expired entries dropped.
    fn admit(&self, now_ms: u64, window_ms: u64, n: u64) -> Self {
        let live = self.live(now_ms, window_ms);
        let mut entries = Vec::with_capacity(live.len() + 1);
        entries.extend_from_slice(live);

        // Timestamps never go backwards inside one log.
        let at = entries.last().map_or(now_ms, |&(last, _)| last.max(now_ms));
        match entries.last_mut() {
            Some((last, units)) if *last == at => *units += n,
            _ => entries.push((at, n)),
        }

        Self {
            entries,
            retired: false,
        }
    }
}

#[derive(Debug)]
struct WindowSlot {
    record: ArcSwap<WindowLog>,
}

impl WindowSlot {
    fn new() -> Self {
        Self {
            record: ArcSwap::from_pointee(WindowLog::default()),
        }
    }

    /// Swap `next` in if the record is still `current`.
    fn commit(&self, current: &Arc<WindowLog>, next: WindowLog) -> bool {
        let previous = self.record.compare_and_swap(current, Arc::new(next));
        Arc::ptr_eq(&previous, current)
    }

    /// Mark the slot retired if it holds nothing live. Returns whether it is retired.
    fn retire_if_idle(&self, now_ms: u64, window_ms: u64) -> bool {
        loop {
            let current = self.record.load_full();
            if current.retired {
                return true;
            }
            if !current.is_idle(now_ms, window_ms) {
                return false;
            }
            if self.commit(&current, WindowLog::retired()) {
                return true;
            }
        }
    }

    fn retire(&self) {
        self.record.store(Arc::new(WindowLog::retired()));
    }
}

/// Tuning for the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalOptions {
    /// CAS attempts per call before giving up with [`LimiterError::Contention`]
    pub retry_budget: u32,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

/// Lock-free in-process rate limiter.
#[derive(Debug)]
pub struct LocalLimiter {
    quota: Quota,
    window_ms: u64,
    retry_budget: u32,
    slots: DashMap<String, Arc<WindowSlot>>,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl LocalLimiter {
    /// Create a local limiter on the system clock.
    pub fn new(quota: Quota) -> Result<Self> {
        Self::with_clock(quota, Arc::new(SystemClock::new()))
    }

    /// Create a local limiter on a custom clock.
    pub fn with_clock(quota: Quota, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_options(quota, LocalOptions::default(), clock)
    }

    /// Create a local limiter with explicit options.
    pub fn with_options(quota: Quota, options: LocalOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        if options.retry_budget == 0 {
            return Err(LimiterError::Config(
                "retry budget must be greater than zero".to_string(),
            ));
        }

        let epoch = clock.now();
        Ok(Self {
            quota,
            window_ms: quota.window_ms(),
            retry_budget: options.retry_budget,
            slots: DashMap::new(),
            clock,
            epoch,
        })
    }

    /// The configured quota.
    pub fn limits(&self) -> Quota {
        self.quota
    }

    fn now_ms(&self) -> u64 {
        millis_since(self.clock.as_ref(), self.epoch)
    }

    fn slot(&self, key: &str) -> Arc<WindowSlot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        let entry = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(WindowSlot::new()));
        Arc::clone(entry.value())
    }

    /// Try to admit a single unit for `key`.
    pub fn allow(&self, key: &str) -> Result<bool> {
        self.allow_n(key, 1)
    }

    /// Try to admit `n` units for `key`.
    pub fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        check_units(n)?;
        let capacity = self.quota.capacity();
        if n > capacity {
            trace!(key = %key, hits = n, capacity, "Request larger than capacity");
            return Ok(false);
        }

        let mut slot = self.slot(key);
        let mut attempts: u32 = 0;

        while attempts < self.retry_budget {
            attempts += 1;

            let current = slot.record.load_full();
            if current.retired {
                // Evicted between lookup and update.
                slot = self.slot(key);
                continue;
            }

            let now_ms = self.now_ms();
            let count = current.count(now_ms, self.window_ms);
            if !window::fits(capacity, count, n) {
                debug!(
                    key = %key,
                    hits = n,
                    count,
                    capacity,
                    "Rate limit exceeded"
                );
                return Ok(false);
            }

            if slot.commit(&current, current.admit(now_ms, self.window_ms, n)) {
                trace!(key = %key, hits = n, count = count + n, attempts, "Admitted");
                return Ok(true);
            }
        }

        warn!(key = %key, attempts, "Gave up on contended key");
        Err(LimiterError::Contention {
            key: key.to_string(),
            attempts,
        })
    }

    /// Units currently available for `key`.
    pub fn remaining(&self, key: &str) -> Result<u64> {
        Ok(self.quota(key)?.remaining)
    }

    /// Quota view for `key`.
    ///
    /// `reset_after` is the time until the oldest counted batch ages out.
    pub fn quota(&self, key: &str) -> Result<QuotaSnapshot> {
        let capacity = self.quota.capacity();
        let record = self
            .slots
            .get(key)
            .map(|slot| slot.record.load_full())
            .unwrap_or_default();

        let now_ms = self.now_ms();
        let live = record.live(now_ms, self.window_ms);
        let count = record.count(now_ms, self.window_ms);
        let reset_after = live
            .first()
            .map(|&(oldest_ms, _)| {
                Duration::from_millis(window::expires_in_ms(oldest_ms, now_ms, self.window_ms))
            })
            .unwrap_or(Duration::ZERO);

        Ok(QuotaSnapshot::new(
            capacity,
            window::remaining(capacity, count),
            reset_after,
        ))
    }

    /// Clear all state for `key`.
    pub fn reset(&self, key: &str) -> Result<()> {
        let removed = self.slots.remove_if(key, |_, slot| {
            slot.retire();
            true
        });
        if removed.is_some() {
            debug!(key = %key, "Reset rate limit state");
        }
        Ok(())
    }

    /// Evict every key whose window has expired. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let now_ms = self.now_ms();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.retire_if_idle(now_ms, self.window_ms));
        let evicted = before.saturating_sub(self.slots.len());

        if evicted > 0 {
            debug!(evicted, remaining = self.slots.len(), "Evicted idle keys");
        }
        evicted
    }

    /// Number of tracked keys, including idle ones not yet swept.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Start a background task that sweeps idle keys every `interval`.
    ///
    /// The task stops when the returned token is cancelled or the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let limiter = Arc::downgrade(self);

        tokio::spawn(async move {
            run_sweep_loop(limiter, interval, cancel_clone).await;
        });

        cancel
    }
}

async fn run_sweep_loop(limiter: Weak<LocalLimiter>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(interval_ms = interval.as_millis() as u64, "Idle key sweeper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.sweep();
            }
        }
    }

    info!("Idle key sweeper stopped");
}

#[async_trait]
impl Limiter for LocalLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        LocalLimiter::allow_n(self, key, n)
    }

    fn limit(&self) -> u64 {
        self.quota.capacity()
    }

    fn window(&self) -> Duration {
        self.quota.window()
    }

    async fn quota(&self, key: &str) -> Result<QuotaSnapshot> {
        LocalLimiter::quota(self, key)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        LocalLimiter::reset(self, key)
    }
}
