//! Sliding window admission control.

mod atomic;
mod backend;
mod failure;
mod key;
mod lease;
mod limiter;
mod rules;

pub use atomic::AtomicSlidingWindowLimiter;
pub use backend::PartitionLimiter;
pub use failure::{FailureMode, FailurePolicy};
pub use key::{KeyNamespace, DEFAULT_KEY_PREFIX};
pub use lease::{Lease, RetryAfter, WindowStatistics, MIN_RETRY_AFTER};
pub use limiter::{SlidingWindowLimiter, DEFAULT_OPERATION_TIMEOUT};
pub use rules::{LimitRule, LimitRules, TimeUnit};
