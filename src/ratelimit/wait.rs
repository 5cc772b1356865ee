//! Cooperative waiting on top of any [`Limiter`].
//!
//! A waiter retries admission with a backoff sized to the time one unit
//! takes to free up (`window / capacity`), suspending the task between
//! attempts. Cancellation and deadlines are checked before every attempt and
//! raced against every sleep, so a cancelled caller never sleeps out a full
//! backoff interval.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::backend::{check_units, Limiter};
use crate::error::{LimiterError, Result};

/// Cancellation signal and optional deadline supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Give up at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Give up after `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The cancellation token; cancelling it aborts any wait using this context.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel every wait using this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail if the context is cancelled or its deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(LimiterError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    fn time_left(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// How long to sleep between denied attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Floor, keeps waiters from tight polling
    pub min_backoff: Duration,
    /// Ceiling
    pub max_backoff: Duration,
    /// Add up to 25% random jitter to spread out competing waiters
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Sleep before retrying `n` units under a quota of `capacity` per `window`.
    pub fn delay(&self, window: Duration, capacity: u64, n: u64) -> Duration {
        let per_unit_ms = window.as_millis() / u128::from(capacity.max(1));
        let base_ms = per_unit_ms.saturating_mul(u128::from(n)).min(u128::from(u64::MAX)) as u64;

        let mut delay = Duration::from_millis(base_ms);
        if self.jitter && base_ms >= 4 {
            let extra = rand::thread_rng().gen_range(0..=base_ms / 4);
            delay += Duration::from_millis(extra);
        }

        let max_backoff = self.max_backoff.max(self.min_backoff);
        delay.clamp(self.min_backoff, max_backoff)
    }
}

/// Retries admission on a limiter until it succeeds or the caller gives up.
pub struct Waiter<'a, L: Limiter + ?Sized> {
    limiter: &'a L,
    policy: BackoffPolicy,
}

impl<'a, L: Limiter + ?Sized> Waiter<'a, L> {
    /// Create a waiter with the default backoff policy.
    pub fn new(limiter: &'a L) -> Self {
        Self::with_policy(limiter, BackoffPolicy::default())
    }

    /// Create a waiter with a custom backoff policy.
    pub fn with_policy(limiter: &'a L, policy: BackoffPolicy) -> Self {
        Self { limiter, policy }
    }

    /// Wait for a single unit.
    pub async fn wait(&self, key: &str, ctx: &WaitContext) -> Result<()> {
        self.wait_n(key, 1, ctx).await
    }

    /// Wait until `n` units are admitted for `key`.
    ///
    /// Returns [`LimiterError::Cancelled`] or [`LimiterError::DeadlineExceeded`]
    /// when the context fires, and propagates store errors immediately.
    pub async fn wait_n(&self, key: &str, n: u64, ctx: &WaitContext) -> Result<()> {
        check_units(n)?;
        let capacity = self.limiter.limit();
        if n > capacity {
            return Err(LimiterError::InvalidArgument(format!(
                "{} units can never fit in a capacity of {}",
                n, capacity
            )));
        }

        let mut attempts: u32 = 0;
        loop {
            ctx.check()?;

            attempts += 1;
            if self.limiter.allow_n(key, n).await? {
                if attempts > 1 {
                    debug!(key = %key, units = n, attempts, "Admitted after waiting");
                }
                return Ok(());
            }

            let mut delay = self.policy.delay(self.limiter.window(), capacity, n);
            if let Some(left) = ctx.time_left() {
                if left.is_zero() {
                    return Err(LimiterError::DeadlineExceeded);
                }
                delay = delay.min(left);
            }

            trace!(
                key = %key,
                units = n,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Denied, backing off"
            );

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(LimiterError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
