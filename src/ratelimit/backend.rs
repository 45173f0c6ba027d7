//! Limiter trait for abstracting the soft and atomic implementations.

use std::time::Duration;

use async_trait::async_trait;

use super::lease::{Lease, WindowStatistics};
use crate::error::Result;

/// Trait for limiter implementations.
///
/// Host layers hold an `Arc<dyn PartitionLimiter>` and map a denied lease to
/// their own "too many requests" response, using the retry hint as the
/// suggested wait.
#[async_trait]
pub trait PartitionLimiter: Send + Sync {
    /// Try to consume `permit_count` permits of `partition_key`, allowing at
    /// most `limit` within the sliding `window`.
    async fn try_acquire(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
    ) -> Result<Lease>;

    /// Current occupancy of `partition_key`'s window.
    async fn get_statistics(&self, partition_key: &str, window: Duration) -> Result<WindowStatistics>;
}
