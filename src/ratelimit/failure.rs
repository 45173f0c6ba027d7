//! Behaviour of the limiter when the shared store misbehaves.
//!
//! An unreachable rate-limit backend must not take the protected resource
//! down with it, so the default mode admits traffic while the store is
//! failing. Deployments that prefer strict enforcement can fail closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::lease::{Lease, WindowStatistics};
use crate::store::{StoreError, StoreOperation};

/// What an acquisition returns while the store is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request
    #[default]
    Open,
    /// Deny the request, asking the caller to retry after one window
    Closed,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::Open => "open",
            FailureMode::Closed => "closed",
        }
    }
}

/// Turns store failures into decisions and makes them visible to operators.
#[derive(Debug, Default)]
pub struct FailurePolicy {
    mode: FailureMode,
    failures: AtomicU64,
}

impl FailurePolicy {
    /// Create a policy with the given mode.
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            failures: AtomicU64::new(0),
        }
    }

    /// The configured mode.
    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    /// Store failures seen since this policy was created.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Decide an acquisition whose store call failed.
    pub fn on_acquire_failure(
        &self,
        partition_key: &str,
        operation: StoreOperation,
        error: &StoreError,
        window: Duration,
    ) -> Lease {
        self.record(partition_key, operation, error);
        match self.mode {
            FailureMode::Open => Lease::acquired(),
            FailureMode::Closed => Lease::denied(window),
        }
    }

    /// Degrade a statistics read whose store call failed.
    pub fn on_statistics_failure(
        &self,
        partition_key: &str,
        operation: StoreOperation,
        error: &StoreError,
        now_ms: i64,
        window_ms: i64,
    ) -> WindowStatistics {
        self.record(partition_key, operation, error);
        WindowStatistics::empty(now_ms, window_ms)
    }

    fn record(&self, partition_key: &str, operation: StoreOperation, error: &StoreError) {
        let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            partition = %partition_key,
            operation = %operation,
            error = %error,
            failure_mode = self.mode.as_str(),
            failures_total = total,
            "Rate limit store call failed; limiter degraded"
        );
    }
}
