//! Sliding-window rate limiting: window arithmetic, backends and waiting.

mod backend;
pub(crate) mod clock;
mod distributed;
mod limiter;
mod local;
mod wait;
pub mod window;

pub use backend::Limiter;
pub use clock::{Clock, MockClock, SystemClock};
pub use distributed::{DistributedLimiter, RecordKeys, DEFAULT_KEY_PREFIX};
pub use limiter::RateLimiter;
pub use local::{LocalLimiter, LocalOptions, DEFAULT_RETRY_BUDGET};
pub use wait::{BackoffPolicy, WaitContext, Waiter};
pub use window::{Quota, QuotaSnapshot, TimeWindow};
