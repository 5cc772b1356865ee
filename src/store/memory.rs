//! In-process shared store.
//!
//! Runs every transaction under one mutex, the way a single-threaded store
//! server executes scripts one at a time, so all keys are serialized
//! together. Several limiters holding the same `Arc<MemoryStore>` behave
//! like processes sharing one external store.
//!
//! Expired keys are reclaimed by writes: at most once per
//! [`PURGE_INTERVAL_MS`] of store time, a write drops every expired entry.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{SharedStore, StoreError, WindowOutcome, WindowTransaction};
use crate::ratelimit::clock::millis_since;
use crate::ratelimit::window;
use crate::ratelimit::{Clock, SystemClock};

/// Minimum store time between two purges of expired keys.
pub const PURGE_INTERVAL_MS: u64 = 1_000;

#[derive(Debug)]
enum Value {
    Log(VecDeque<(u64, u64)>),
    Counter(u64),
    Text(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at_ms: u64,
}

/// Shared store kept in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    last_purge_ms: AtomicU64,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            entries: Mutex::new(HashMap::new()),
            last_purge_ms: AtomicU64::new(0),
            clock,
            epoch,
        }
    }

    fn now_ms(&self) -> u64 {
        millis_since(self.clock.as_ref(), self.epoch)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now_ms = self.now_ms();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at_ms > now_ms)
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys held, including expired ones not yet purged.
    pub fn physical_len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop expired keys. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.now_ms();
        let mut entries = self.entries.lock();
        self.purge_locked(&mut entries, now_ms)
    }

    fn purge_locked(&self, entries: &mut HashMap<String, Entry>, now_ms: u64) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at_ms > now_ms);
        self.last_purge_ms.store(now_ms, Ordering::Relaxed);

        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, remaining = entries.len(), "Purged expired store keys");
        }
        purged
    }

    /// Purge if the last purge is at least [`PURGE_INTERVAL_MS`] old.
    fn purge_if_due(&self, entries: &mut HashMap<String, Entry>, now_ms: u64) {
        let last = self.last_purge_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) >= PURGE_INTERVAL_MS {
            self.purge_locked(entries, now_ms);
        }
    }

    fn admit(
        entries: &mut HashMap<String, Entry>,
        now_ms: u64,
        log_key: String,
        seq_key: String,
        window_ms: u64,
        capacity: u64,
        units: u64,
    ) -> Result<WindowOutcome, StoreError> {
        let mut log = match entries.remove(&log_key) {
            Some(Entry {
                value: Value::Log(log),
                expires_at_ms,
            }) if expires_at_ms > now_ms => log,
            Some(Entry {
                value: Value::Log(_),
                ..
            })
            | None => VecDeque::new(),
            Some(other) => {
                entries.insert(log_key.clone(), other);
                return Err(StoreError::Protocol(format!(
                    "key {} does not hold an admission log",
                    log_key
                )));
            }
        };

        if let Some(cutoff) = window::expired_through(now_ms, window_ms) {
            while log.front().is_some_and(|&(at, _)| at <= cutoff) {
                log.pop_front();
            }
        }

        let mut count = log.iter().fold(0u64, |acc, &(_, w)| acc.saturating_add(w));
        let admitted = window::fits(capacity, count, units);
        let expires_at_ms = if admitted {
            log.push_back((now_ms, units));
            count += units;

            let seq = match entries.get(&seq_key) {
                Some(Entry {
                    value: Value::Counter(seq),
                    expires_at_ms,
                }) if *expires_at_ms > now_ms => seq + 1,
                _ => 1,
            };
            let expires_at_ms = now_ms + window_ms;
            entries.insert(
                seq_key,
                Entry {
                    value: Value::Counter(seq),
                    expires_at_ms,
                },
            );
            Some(expires_at_ms)
        } else {
            None
        };

        let oldest_ms = log.front().map(|&(at, _)| at);
        if !log.is_empty() {
            // Denials keep the expiry set by the last admission.
            let expires_at_ms = expires_at_ms.unwrap_or_else(|| {
                log.back()
                    .map(|&(at, _)| at + window_ms)
                    .unwrap_or(now_ms + window_ms)
            });
            entries.insert(
                log_key,
                Entry {
                    value: Value::Log(log),
                    expires_at_ms,
                },
            );
        }

        Ok(WindowOutcome {
            admitted,
            count,
            oldest_ms,
            now_ms,
        })
    }

    fn inspect(
        entries: &HashMap<String, Entry>,
        now_ms: u64,
        log_key: &str,
        window_ms: u64,
    ) -> Result<WindowOutcome, StoreError> {
        let live: Vec<(u64, u64)> = match entries.get(log_key) {
            Some(Entry {
                value: Value::Log(log),
                expires_at_ms,
            }) if *expires_at_ms > now_ms => log
                .iter()
                .copied()
                .filter(|&(at, _)| !window::is_expired(at, now_ms, window_ms))
                .collect(),
            Some(Entry {
                value: Value::Log(_),
                ..
            })
            | None => Vec::new(),
            Some(_) => {
                return Err(StoreError::Protocol(format!(
                    "key {} does not hold an admission log",
                    log_key
                )))
            }
        };

        Ok(WindowOutcome {
            admitted: false,
            count: window::log_count(live.iter().copied(), now_ms, window_ms),
            oldest_ms: live.first().map(|&(at, _)| at),
            now_ms,
        })
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn execute(&self, tx: WindowTransaction) -> Result<WindowOutcome, StoreError> {
        let now_ms = self.now_ms();
        let mut entries = self.entries.lock();

        match tx {
            WindowTransaction::Admit {
                log_key,
                seq_key,
                window_ms,
                capacity,
                units,
            } => {
                self.purge_if_due(&mut entries, now_ms);
                Self::admit(&mut entries, now_ms, log_key, seq_key, window_ms, capacity, units)
            }
            WindowTransaction::Inspect { log_key, window_ms } => {
                Self::inspect(&entries, now_ms, &log_key, window_ms)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now_ms = self.now_ms();
        let entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expires_at_ms <= now_ms => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(Entry {
                value: Value::Counter(n),
                ..
            }) => Ok(Some(n.to_string())),
            Some(_) => Err(StoreError::Protocol(format!(
                "key {} does not hold a plain value",
                key
            ))),
            None => Ok(None),
        }
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now_ms = self.now_ms();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let mut entries = self.entries.lock();
        self.purge_if_due(&mut entries, now_ms);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MockClock;

    fn store() -> (MemoryStore, MockClock) {
        let clock = MockClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn admit(units: u64) -> WindowTransaction {
        WindowTransaction::Admit {
            log_key: "p:k:log".to_string(),
            seq_key: "p:k:seq".to_string(),
            window_ms: 1_000,
            capacity: 10,
            units,
        }
    }

    fn inspect() -> WindowTransaction {
        WindowTransaction::Inspect {
            log_key: "p:k:log".to_string(),
            window_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_admit_appends_until_capacity() {
        let (store, _clock) = store();

        let outcome = store.execute(admit(6)).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.count, 6);
        assert_eq!(outcome.oldest_ms, Some(0));

        let outcome = store.execute(admit(5)).await.unwrap();
        assert!(!outcome.admitted);
        assert_eq!(outcome.count, 6);

        assert!(store.execute(admit(4)).await.unwrap().admitted);
        assert_eq!(store.get("p:k:seq").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_entries_age_out_individually() {
        let (store, clock) = store();
        store.execute(admit(4)).await.unwrap();
        clock.advance(Duration::from_millis(400));
        store.execute(admit(6)).await.unwrap();

        clock.advance(Duration::from_millis(600));
        let outcome = store.execute(inspect()).await.unwrap();
        assert_eq!(outcome.count, 6);
        assert_eq!(outcome.oldest_ms, Some(400));

        let outcome = store.execute(admit(4)).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.count, 10);
    }

    #[tokio::test]
    async fn test_inspect_does_not_mutate() {
        let (store, clock) = store();
        store.execute(admit(3)).await.unwrap();
        clock.advance(Duration::from_millis(1_000));

        assert_eq!(store.execute(inspect()).await.unwrap().count, 0);
        // The expired entry is still physically present until the next admission.
        assert_eq!(store.entries.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_keys_expire_after_window() {
        let (store, clock) = store();
        store.execute(admit(1)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_millis(1_000));
        assert!(store.is_empty());
        assert_eq!(store.purge_expired(), 2);
    }

    #[tokio::test]
    async fn test_plain_values_and_delete() {
        let (store, clock) = store();
        store
            .set_with_expiry("p:quota", "10:1000", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.get("p:quota").await.unwrap(), Some("10:1000".to_string()));

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("p:quota").await.unwrap(), None);

        store.execute(admit(1)).await.unwrap();
        store
            .delete(&["p:k:log".to_string(), "p:k:seq".to_string(), "absent".to_string()])
            .await
            .unwrap();
        assert_eq!(store.execute(inspect()).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_wrong_type_is_protocol_error() {
        let (store, _clock) = store();
        store
            .set_with_expiry("p:k:log", "text", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(
            store.execute(admit(1)).await,
            Err(StoreError::Protocol(_))
        ));
        assert_eq!(store.get("p:k:log").await.unwrap(), Some("text".to_string()));
    }

    #[tokio::test]
    async fn test_writes_reclaim_expired_keys() {
        let (store, clock) = store();
        for i in 0..1_000 {
            let outcome = store
                .execute(WindowTransaction::Admit {
                    log_key: format!("p:{{{}}}:log", i),
                    seq_key: format!("p:{{{}}}:seq", i),
                    window_ms: 1_000,
                    capacity: 10,
                    units: 1,
                })
                .await
                .unwrap();
            assert!(outcome.admitted);
        }
        assert_eq!(store.physical_len(), 2_000);

        clock.advance(Duration::from_secs(10));
        store.execute(admit(1)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.physical_len(), 2);
    }

    #[tokio::test]
    async fn test_purge_waits_for_interval() {
        let (store, clock) = store();
        store.execute(admit(1)).await.unwrap();

        clock.advance(Duration::from_millis(PURGE_INTERVAL_MS));
        store
            .set_with_expiry("p:quota", "10:1000", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(store.physical_len(), 1);

        // Expired again, but the last purge was just now.
        clock.advance(Duration::from_millis(1));
        store.execute(admit(1)).await.unwrap();
        assert_eq!(store.physical_len(), 3);
        assert_eq!(store.len(), 2);
    }
}
