//! Sliding-window arithmetic shared by the local and distributed stores.
//!
//! All values are milliseconds on a single clock. A unit admitted at `t` is
//! counted while `now - t < window` and is expired once `now - t >= window`,
//! so age is always measured against the current time rather than against a
//! fixed epoch boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LimiterError, Result};

/// Largest window the arithmetic accepts (about 49 days).
pub const MAX_WINDOW_MS: u64 = u32::MAX as u64;

/// Named window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// One second
    Second,
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One day
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// Capacity per window, immutable for the lifetime of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    capacity: u64,
    window: Duration,
}

impl Quota {
    /// Create a quota of `capacity` units per `window`.
    ///
    /// Fails if the capacity is zero or the window is shorter than one
    /// millisecond or longer than [`MAX_WINDOW_MS`].
    pub fn new(capacity: u64, window: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(LimiterError::Config("capacity must be greater than zero".to_string()));
        }
        if window.is_zero() {
            return Err(LimiterError::Config("window must be greater than zero".to_string()));
        }
        let window_ms = window.as_millis();
        if window_ms == 0 {
            return Err(LimiterError::Config(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }
        if window_ms > MAX_WINDOW_MS as u128 {
            return Err(LimiterError::Config(format!(
                "window must be at most {}ms, got {}ms",
                MAX_WINDOW_MS, window_ms
            )));
        }

        Ok(Self {
            capacity,
            // Truncate to whole milliseconds so every store sees the same window.
            window: Duration::from_millis(window_ms as u64),
        })
    }

    /// Create a quota over a named window.
    pub fn per(capacity: u64, window: TimeWindow) -> Result<Self> {
        Self::new(capacity, window.duration())
    }

    /// Maximum units admitted per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Milliseconds between `start_ms` and `now_ms`; zero if `now_ms` is earlier.
pub fn elapsed_ms(start_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(start_ms)
}

/// Whether activity recorded at `start_ms` has aged out of the window.
pub fn is_expired(start_ms: u64, now_ms: u64, window_ms: u64) -> bool {
    elapsed_ms(start_ms, now_ms) >= window_ms
}

/// Milliseconds until activity recorded at `start_ms` expires.
pub fn expires_in_ms(start_ms: u64, now_ms: u64, window_ms: u64) -> u64 {
    window_ms.saturating_sub(elapsed_ms(start_ms, now_ms))
}

/// Latest timestamp that is already expired at `now_ms`.
///
/// Returns `None` while `now_ms < window_ms`: nothing can have expired yet.
pub fn expired_through(now_ms: u64, window_ms: u64) -> Option<u64> {
    now_ms.checked_sub(window_ms)
}

/// Sum of weights of `(timestamp_ms, weight)` entries still inside the window.
pub fn log_count<I>(entries: I, now_ms: u64, window_ms: u64) -> u64
where
    I: IntoIterator<Item = (u64, u64)>,
{
    entries
        .into_iter()
        .filter(|&(at, _)| !is_expired(at, now_ms, window_ms))
        .fold(0u64, |acc, (_, weight)| acc.saturating_add(weight))
}

/// Whether `n` more units fit on top of `count`.
pub fn fits(capacity: u64, count: u64, n: u64) -> bool {
    count.checked_add(n).is_some_and(|total| total <= capacity)
}

/// Units still available.
pub fn remaining(capacity: u64, count: u64) -> u64 {
    capacity.saturating_sub(count)
}

/// Read-only quota view for one key, derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    /// Capacity per window
    pub limit: u64,
    /// Units available right now
    pub remaining: u64,
    /// Time until the oldest counted units expire; zero when nothing is counted
    #[serde(with = "duration_millis")]
    pub reset_after: Duration,
    /// Wall-clock instant matching `reset_after`
    pub reset_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    /// Build a snapshot; `reset_at` is anchored to the current wall clock.
    pub fn new(limit: u64, remaining: u64, reset_after: Duration) -> Self {
        let offset = chrono::Duration::from_std(reset_after).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            limit,
            remaining,
            reset_after,
            reset_at: Utc::now() + offset,
        }
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
