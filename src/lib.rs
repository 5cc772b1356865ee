//! Windowgate - per-key sliding-window admission control
//!
//! A limiter admits at most `capacity` units per key within any window of
//! fixed length. State lives either in this process ([`LocalLimiter`]) or in
//! a store shared by a fleet ([`DistributedLimiter`]); callers program
//! against the [`Limiter`] trait and may block cooperatively with
//! [`Limiter::wait`].

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{LimiterError, Result};
pub use ratelimit::{
    DistributedLimiter, Limiter, LocalLimiter, Quota, QuotaSnapshot, RateLimiter, WaitContext,
};
