#![cfg(feature = "redis")]

//! Redis adapter tests. Run with a server available:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1/ cargo test --features redis -- --ignored
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use windowgate::ratelimit::{DistributedLimiter, Quota};
use windowgate::store::{RedisStore, SharedStore};
use windowgate::LimiterError;

fn redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

fn unique_prefix() -> String {
    let n: u64 = rand::random();
    format!("windowgate_test_{n}")
}

async fn limiter(capacity: u64, window: Duration) -> (DistributedLimiter, Arc<dyn SharedStore>) {
    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&redis_url()).await.unwrap());
    let quota = Quota::new(capacity, window).unwrap();
    let limiter = DistributedLimiter::with_prefix(quota, Arc::clone(&store), unique_prefix()).unwrap();
    (limiter, store)
}

#[tokio::test]
#[ignore = "requires a Redis server (REDIS_URL)"]
async fn admits_up_to_capacity() {
    let (limiter, _store) = limiter(5, Duration::from_secs(10)).await;

    assert!(limiter.allow_n("k", 3).await.unwrap());
    assert!(limiter.allow_n("k", 2).await.unwrap());
    assert!(!limiter.allow("k").await.unwrap());

    let snapshot = limiter.quota("k").await.unwrap();
    assert_eq!(snapshot.remaining, 0);
    assert!(snapshot.reset_after > Duration::ZERO);
    assert!(snapshot.reset_after <= Duration::from_secs(10));

    limiter.reset("k").await.unwrap();
    assert_eq!(limiter.remaining("k").await.unwrap(), 5);
}

#[tokio::test]
#[ignore = "requires a Redis server (REDIS_URL)"]
async fn window_slides_in_real_time() {
    let (limiter, _store) = limiter(2, Duration::from_millis(300)).await;

    assert!(limiter.allow_n("k", 2).await.unwrap());
    assert!(!limiter.allow("k").await.unwrap());

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(limiter.allow("k").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a Redis server (REDIS_URL)"]
async fn concurrent_processes_share_capacity() {
    let (first, store) = limiter(50, Duration::from_secs(30)).await;
    let second = DistributedLimiter::with_prefix(first.limits(), store, first.prefix()).unwrap();

    let tasks: Vec<_> = (0..400)
        .map(|i| {
            let limiter = if i % 2 == 0 { first.clone() } else { second.clone() };
            tokio::spawn(async move { limiter.allow("hot").await.unwrap() })
        })
        .collect();

    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|result| *result.as_ref().unwrap())
        .count();
    assert_eq!(admitted, 50);

    first.reset("hot").await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server (REDIS_URL)"]
async fn announce_rejects_conflicting_quota() {
    let (limiter, store) = limiter(10, Duration::from_secs(1)).await;
    limiter.announce_quota().await.unwrap();

    let other = DistributedLimiter::with_prefix(
        Quota::new(20, Duration::from_secs(1)).unwrap(),
        Arc::clone(&store),
        limiter.prefix(),
    )
    .unwrap();
    assert!(matches!(other.announce_quota().await, Err(LimiterError::Config(_))));

    store.delete(&[format!("{}:quota", limiter.prefix())]).await.unwrap();
}
