//! Shared store capability used by the distributed limiter.
//!
//! The limiter never talks to a concrete database. It hands a
//! [`WindowTransaction`] to a [`SharedStore`], which must run it as one
//! indivisible read-check-write step, and it uses plain get/set-with-expiry
//! and delete for everything else.
//!
//! Every admission log is a time-ordered collection of `(timestamp_ms, units)`
//! entries. Entries at or before `now - window` are pruned, the remaining
//! weights are summed, and a new entry is appended only if the sum plus the
//! requested units fits the capacity. Timestamps come from the store's own
//! clock so that every process sharing the store agrees on `now`.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{MemoryStore, PURGE_INTERVAL_MS};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a shared store.
///
/// These are always distinct from a denial: a limiter never turns a store
/// failure into an admit or a deny.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something the limiter cannot interpret
    #[error("unexpected store reply: {0}")]
    Protocol(String),

    /// Redis client error
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl StoreError {
    /// Whether the failure is likely to clear up on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Protocol(_) => false,
            #[cfg(feature = "redis")]
            StoreError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
        }
    }
}

/// One indivisible operation on an admission log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowTransaction {
    /// Prune expired entries, then append `units` if they fit under `capacity`,
    /// refreshing the expiry of both keys to the window length.
    Admit {
        /// Key of the admission log
        log_key: String,
        /// Key of the entry sequence counter
        seq_key: String,
        /// Window length in milliseconds
        window_ms: u64,
        /// Capacity per window
        capacity: u64,
        /// Units requested
        units: u64,
    },
    /// Count the entries still inside the window without modifying anything.
    Inspect {
        /// Key of the admission log
        log_key: String,
        /// Window length in milliseconds
        window_ms: u64,
    },
}

/// Result of a [`WindowTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the units were appended; always false for `Inspect`
    pub admitted: bool,
    /// Units inside the window after the transaction
    pub count: u64,
    /// Timestamp of the oldest entry still inside the window
    pub oldest_ms: Option<u64>,
    /// The store's clock when the transaction ran
    pub now_ms: u64,
}

/// Capability interface for the external store shared by a fleet.
#[async_trait]
pub trait SharedStore: Send + Sync + Debug {
    /// Execute one transaction atomically.
    async fn execute(&self, tx: WindowTransaction) -> Result<WindowOutcome, StoreError>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a plain value that expires after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete keys; missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}
