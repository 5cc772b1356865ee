//! Limiter contract shared by the local and distributed backends.

use async_trait::async_trait;
use std::time::Duration;

use super::wait::{WaitContext, Waiter};
use super::window::QuotaSnapshot;
use crate::error::{LimiterError, Result};

/// Trait for rate limiter implementations.
///
/// Callers depend only on this trait; the backend is chosen at construction
/// time. A denied request is `Ok(false)`, never an error.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Try to admit `n` units for `key`.
    ///
    /// Fails with [`LimiterError::InvalidArgument`] if `n` is zero. Requests
    /// larger than the capacity are denied without touching state.
    async fn allow_n(&self, key: &str, n: u64) -> Result<bool>;

    /// Try to admit a single unit for `key`.
    async fn allow(&self, key: &str) -> Result<bool> {
        self.allow_n(key, 1).await
    }

    /// Capacity per window.
    fn limit(&self) -> u64;

    /// Window length.
    fn window(&self) -> Duration;

    /// Quota view for `key`. Never mutates state.
    async fn quota(&self, key: &str) -> Result<QuotaSnapshot>;

    /// Units currently available for `key`.
    ///
    /// Best effort: under concurrency the value may be stale by the time the
    /// caller acts on it.
    async fn remaining(&self, key: &str) -> Result<u64> {
        Ok(self.quota(key).await?.remaining)
    }

    /// Clear all state for `key`. A missing key is not an error.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Block cooperatively until one unit is admitted for `key`.
    async fn wait(&self, key: &str, ctx: &WaitContext) -> Result<()> {
        self.wait_n(key, 1, ctx).await
    }

    /// Block cooperatively until `n` units are admitted for `key`.
    async fn wait_n(&self, key: &str, n: u64, ctx: &WaitContext) -> Result<()> {
        Waiter::new(self).wait_n(key, n, ctx).await
    }
}

/// Reject zero-unit requests.
pub(crate) fn check_units(n: u64) -> Result<()> {
    if n == 0 {
        return Err(LimiterError::InvalidArgument(
            "units must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_units() {
        assert!(check_units(1).is_ok());
        assert!(matches!(
            check_units(0),
            Err(LimiterError::InvalidArgument(_))
        ));
    }
}
