//! Behaviour every backend must share, exercised through the public API.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use windowgate::ratelimit::{
    DistributedLimiter, Limiter, LocalLimiter, MockClock, Quota, RateLimiter, WaitContext,
};
use windowgate::store::{MemoryStore, SharedStore};
use windowgate::LimiterError;

fn backends(capacity: u64, window: Duration) -> Vec<(RateLimiter, MockClock)> {
    let quota = Quota::new(capacity, window).unwrap();

    let local_clock = MockClock::default();
    let local = LocalLimiter::with_clock(quota, Arc::new(local_clock.clone())).unwrap();

    let store_clock = MockClock::default();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock(Arc::new(store_clock.clone())));
    let distributed = DistributedLimiter::new(quota, store);

    vec![(local.into(), local_clock), (distributed.into(), store_clock)]
}

#[tokio::test]
async fn exhausts_then_recovers_after_window() {
    for (limiter, clock) in backends(10, Duration::from_secs(1)) {
        let name = limiter.backend_name();
        for _ in 0..10 {
            assert!(limiter.allow("user:1").await.unwrap(), "{}", name);
        }
        assert!(!limiter.allow("user:1").await.unwrap(), "{}", name);

        clock.advance(Duration::from_millis(500));
        assert_eq!(limiter.remaining("user:1").await.unwrap(), 0, "{}", name);

        clock.advance(Duration::from_millis(510));
        assert_eq!(limiter.remaining("user:1").await.unwrap(), 10, "{}", name);
        assert!(limiter.allow("user:1").await.unwrap(), "{}", name);
    }
}

#[tokio::test]
async fn no_burst_across_window_edge() {
    for (limiter, clock) in backends(10, Duration::from_secs(1)) {
        let name = limiter.backend_name();
        assert!(limiter.allow("k").await.unwrap(), "{}", name);

        clock.advance(Duration::from_millis(998));
        assert!(limiter.allow_n("k", 9).await.unwrap(), "{}", name);
        assert_eq!(limiter.remaining("k").await.unwrap(), 0, "{}", name);

        // Two milliseconds later only the first unit has aged out.
        clock.advance(Duration::from_millis(2));
        assert_eq!(limiter.remaining("k").await.unwrap(), 1, "{}", name);
        assert!(!limiter.allow_n("k", 10).await.unwrap(), "{}", name);
        assert!(limiter.allow("k").await.unwrap(), "{}", name);
        assert!(!limiter.allow("k").await.unwrap(), "{}", name);

        // The batch admitted at 998ms frees up at 1998ms.
        clock.advance(Duration::from_millis(998));
        assert_eq!(limiter.remaining("k").await.unwrap(), 9, "{}", name);
    }
}

#[tokio::test]
async fn oversized_and_zero_requests() {
    for (limiter, _clock) in backends(5, Duration::from_secs(1)) {
        let name = limiter.backend_name();
        assert!(!limiter.allow_n("k", 6).await.unwrap(), "{}", name);
        assert_eq!(limiter.remaining("k").await.unwrap(), 5, "{}", name);

        assert!(
            matches!(limiter.allow_n("k", 0).await, Err(LimiterError::InvalidArgument(_))),
            "{}",
            name
        );
    }
}

#[tokio::test]
async fn remaining_and_reset() {
    for (limiter, _clock) in backends(4, Duration::from_secs(60)) {
        let name = limiter.backend_name();
        assert!(limiter.allow_n("k", 3).await.unwrap(), "{}", name);
        assert_eq!(limiter.remaining("k").await.unwrap(), 1, "{}", name);
        assert!(limiter.allow("k").await.unwrap(), "{}", name);
        assert_eq!(limiter.remaining("k").await.unwrap(), 0, "{}", name);

        let snapshot = limiter.quota("k").await.unwrap();
        assert_eq!(snapshot.limit, 4);
        assert_eq!(snapshot.reset_after, Duration::from_secs(60), "{}", name);

        limiter.reset("k").await.unwrap();
        limiter.reset("missing").await.unwrap();
        assert!(limiter.allow("k").await.unwrap(), "{}", name);
        assert_eq!(limiter.remaining("other").await.unwrap(), 4, "{}", name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_capacity() {
    for (limiter, _clock) in backends(100, Duration::from_secs(60)) {
        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    loop {
                        match limiter.allow("hot").await {
                            Ok(admitted) => return admitted,
                            Err(e) if e.is_transient() => continue,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 100, "{}", limiter.backend_name());
    }
}

#[tokio::test]
async fn cancelled_wait_admits_nothing() {
    for (limiter, _clock) in backends(3, Duration::from_secs(1)) {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = WaitContext::new().with_cancel(cancel);

        assert!(matches!(limiter.wait("k", &ctx).await, Err(LimiterError::Cancelled)));
        assert_eq!(limiter.remaining("k").await.unwrap(), 3);
    }
}

#[tokio::test]
async fn wait_respects_deadline_when_exhausted() {
    for (limiter, _clock) in backends(1, Duration::from_secs(60)) {
        assert!(limiter.allow("k").await.unwrap());

        let ctx = WaitContext::new().with_timeout(Duration::from_millis(30));
        assert!(matches!(
            limiter.wait("k", &ctx).await,
            Err(LimiterError::DeadlineExceeded)
        ));

        let ctx = WaitContext::new();
        assert!(matches!(
            limiter.wait_n("k", 2, &ctx).await,
            Err(LimiterError::InvalidArgument(_))
        ));
    }
}

#[tokio::test]
async fn distributed_limiters_share_one_store() {
    let quota = Quota::new(5, Duration::from_secs(1)).unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let fleet: Vec<RateLimiter> = (0..3)
        .map(|_| DistributedLimiter::new(quota, Arc::clone(&store)).into())
        .collect();

    let mut admitted = 0;
    for _ in 0..4 {
        for limiter in &fleet {
            if limiter.allow("tenant:1").await.unwrap() {
                admitted += 1;
            }
        }
    }
    assert_eq!(admitted, 5);
}
