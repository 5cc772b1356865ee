//! Backend-agnostic rate limiter handle.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::backend::Limiter;
use super::distributed::DistributedLimiter;
use super::local::LocalLimiter;
use super::window::{Quota, QuotaSnapshot};
use crate::error::Result;
use crate::store::SharedStore;

/// A rate limiter on one of the supported backends.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub enum RateLimiter {
    /// State kept in this process
    Local(Arc<LocalLimiter>),
    /// State kept in a shared store
    Distributed(DistributedLimiter),
}

impl RateLimiter {
    /// Create a local rate limiter.
    pub fn local(quota: Quota) -> Result<Self> {
        Ok(Self::Local(Arc::new(LocalLimiter::new(quota)?)))
    }

    /// Create a distributed rate limiter over `store`.
    pub fn distributed(quota: Quota, store: Arc<dyn SharedStore>) -> Self {
        Self::Distributed(DistributedLimiter::new(quota, store))
    }

    /// Short name of the backend, for logs.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Distributed(_) => "distributed",
        }
    }

    /// Start idle-key eviction if the backend keeps state in process.
    ///
    /// Distributed state expires in the store, so this returns `None` there.
    pub fn spawn_sweeper(&self, interval: Duration) -> Option<CancellationToken> {
        match self {
            Self::Local(limiter) => Some(limiter.spawn_sweeper(interval)),
            Self::Distributed(_) => None,
        }
    }

    fn backend(&self) -> &dyn Limiter {
        match self {
            Self::Local(limiter) => limiter.as_ref(),
            Self::Distributed(limiter) => limiter,
        }
    }
}

impl From<LocalLimiter> for RateLimiter {
    fn from(limiter: LocalLimiter) -> Self {
        Self::Local(Arc::new(limiter))
    }
}

impl From<DistributedLimiter> for RateLimiter {
    fn from(limiter: DistributedLimiter) -> Self {
        Self::Distributed(limiter)
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        self.backend().allow_n(key, n).await
    }

    fn limit(&self) -> u64 {
        self.backend().limit()
    }

    fn window(&self) -> Duration {
        self.backend().window()
    }

    async fn quota(&self, key: &str) -> Result<QuotaSnapshot> {
        self.backend().quota(key).await
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.backend().reset(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::WaitContext;
    use crate::store::MemoryStore;

    fn quota() -> Quota {
        Quota::new(3, Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_local_dispatch() {
        let limiter = RateLimiter::local(quota()).unwrap();
        assert_eq!(limiter.backend_name(), "local");
        assert_eq!(limiter.limit(), 3);
        assert_eq!(limiter.window(), Duration::from_secs(1));

        assert!(limiter.allow_n("k", 3).await.unwrap());
        assert!(!limiter.allow("k").await.unwrap());
        assert_eq!(limiter.remaining("k").await.unwrap(), 0);

        limiter.reset("k").await.unwrap();
        assert_eq!(limiter.quota("k").await.unwrap().remaining, 3);
    }

    #[tokio::test]
    async fn test_distributed_dispatch() {
        let limiter = RateLimiter::distributed(quota(), Arc::new(MemoryStore::new()));
        assert_eq!(limiter.backend_name(), "distributed");

        limiter.wait("k", &WaitContext::new()).await.unwrap();
        assert_eq!(limiter.remaining("k").await.unwrap(), 2);
        assert!(limiter.spawn_sweeper(Duration::from_secs(1)).is_none());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let limiter = RateLimiter::local(quota()).unwrap();
        let clone = limiter.clone();

        assert!(limiter.allow_n("k", 2).await.unwrap());
        assert_eq!(clone.remaining("k").await.unwrap(), 1);

        let token = clone.spawn_sweeper(Duration::from_millis(10));
        assert!(token.is_some());
        if let Some(token) = token {
            token.cancel();
        }
    }
}
