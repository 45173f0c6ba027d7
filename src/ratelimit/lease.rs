//! Acquisition decisions and window statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::millis_to_datetime;

/// Shortest retry hint handed to a denied caller.
pub const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

/// How long a denied caller should wait before trying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    /// Room frees up after this long
    After(Duration),
    /// The request asks for more permits than the limit allows; it can never succeed
    Never,
}

impl RetryAfter {
    /// The wait as a duration, `None` for [`RetryAfter::Never`].
    pub fn duration(&self) -> Option<Duration> {
        match self {
            RetryAfter::After(d) => Some(*d),
            RetryAfter::Never => None,
        }
    }
}

/// The decision returned by an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    acquired: bool,
    retry_after: Option<RetryAfter>,
}

impl Lease {
    /// An admitted lease.
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            retry_after: None,
        }
    }

    /// A denied lease with a retry hint, never shorter than [`MIN_RETRY_AFTER`].
    pub fn denied(retry_after: Duration) -> Self {
        Self {
            acquired: false,
            retry_after: Some(RetryAfter::After(retry_after.max(MIN_RETRY_AFTER))),
        }
    }

    /// A denied lease for a request that can never be admitted.
    pub fn never() -> Self {
        Self {
            acquired: false,
            retry_after: Some(RetryAfter::Never),
        }
    }

    /// Whether the permits were granted.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Retry hint, only present on denial.
    pub fn retry_after(&self) -> Option<RetryAfter> {
        self.retry_after
    }

    /// Retry hint rounded up to whole seconds, as used by `Retry-After` headers.
    ///
    /// `None` when admitted or when the request can never succeed.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let d = self.retry_after?.duration()?;
        let secs = d.as_secs();
        Some(if d.subsec_nanos() > 0 { secs + 1 } else { secs })
    }
}

/// Live occupancy of a partition's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStatistics {
    /// Entries currently inside the window
    pub current_count: u64,
    /// Oldest instant still inside the window
    pub window_start: DateTime<Utc>,
    /// The observation instant
    pub window_end: DateTime<Utc>,
}

impl WindowStatistics {
    /// Build statistics for the window `[now_ms - window_ms, now_ms]`.
    pub fn new(current_count: u64, now_ms: i64, window_ms: i64) -> Self {
        Self {
            current_count,
            window_start: millis_to_datetime(now_ms.saturating_sub(window_ms)),
            window_end: millis_to_datetime(now_ms),
        }
    }

    /// A zero-count snapshot, returned when the store cannot be read.
    pub fn empty(now_ms: i64, window_ms: i64) -> Self {
        Self::new(0, now_ms, window_ms)
    }
}
