//! Opt-in limiter that never overshoots.
//!
//! Trim, count, and the conditional write run as one store-side transaction,
//! so concurrent callers cannot both see the same free slot. The decision
//! contract is otherwise identical to [`SlidingWindowLimiter`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::lease::{Lease, WindowStatistics};
use super::limiter::{retry_after, Request, SlidingWindowLimiter, StepError};
use crate::error::Result;
use crate::store::{AtomicAcquire, AtomicOrderedStore, StoreOperation, WindowEntry};

/// A sliding window limiter whose admission check is a single transaction.
pub struct AtomicSlidingWindowLimiter<S> {
    inner: SlidingWindowLimiter<S>,
}

impl<S: AtomicOrderedStore> AtomicSlidingWindowLimiter<S> {
    /// Create an atomic limiter with default settings.
    pub fn new(store: Arc<S>) -> Self {
        Self::from_limiter(SlidingWindowLimiter::new(store))
    }

    /// Reuse the namespace, clock, failure policy, deadline, and rules of a
    /// configured soft limiter.
    pub fn from_limiter(inner: SlidingWindowLimiter<S>) -> Self {
        Self { inner }
    }

    /// The soft limiter sharing this limiter's settings.
    pub fn limiter(&self) -> &SlidingWindowLimiter<S> {
        &self.inner
    }

    /// Atomic counterpart of [`SlidingWindowLimiter::try_acquire`].
    pub async fn try_acquire(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
    ) -> Result<Lease> {
        self.acquire_with(
            partition_key,
            permit_count,
            window,
            limit,
            self.inner.operation_timeout(),
            std::future::pending::<()>(),
        )
        .await
    }

    /// Atomic counterpart of [`SlidingWindowLimiter::try_acquire_within`].
    pub async fn try_acquire_within(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
        timeout: Duration,
    ) -> Result<Lease> {
        self.acquire_with(
            partition_key,
            permit_count,
            window,
            limit,
            timeout,
            std::future::pending::<()>(),
        )
        .await
    }

    /// Atomic counterpart of [`SlidingWindowLimiter::try_acquire_until`].
    pub async fn try_acquire_until<F>(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
        cancel: F,
    ) -> Result<Lease>
    where
        F: Future<Output = ()> + Send,
    {
        self.acquire_with(
            partition_key,
            permit_count,
            window,
            limit,
            self.inner.operation_timeout(),
            cancel,
        )
        .await
    }

    /// Acquire using a named rule from the inner limiter's rule set.
    pub async fn try_acquire_rule(
        &self,
        partition_key: &str,
        rule_name: &str,
        permit_count: u32,
    ) -> Result<Lease> {
        let rule = self.inner.resolve_rule(rule_name)?;
        self.try_acquire(partition_key, permit_count, rule.window(), rule.requests_per_unit)
            .await
    }

    /// Statistics are read-only, so they share the soft path.
    pub async fn get_statistics(
        &self,
        partition_key: &str,
        window: Duration,
    ) -> Result<WindowStatistics> {
        self.inner.get_statistics(partition_key, window).await
    }

    async fn acquire_with<F>(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
        timeout: Duration,
        cancel: F,
    ) -> Result<Lease>
    where
        F: Future<Output = ()> + Send,
    {
        let request = match self.inner.prepare(partition_key, permit_count, window, limit)? {
            Ok(request) => request,
            Err(lease) => return Ok(lease),
        };

        let key = self.inner.namespace().store_key(partition_key);
        let now = self.inner.now_millis();
        let entries = WindowEntry::batch(now, request.permit_count);

        let attempt = self.acquire_steps(&key, now, request, &entries);

        Ok(self
            .inner
            .settle_acquire(partition_key, request, attempt, timeout, cancel)
            .await)
    }

    async fn acquire_steps(
        &self,
        key: &str,
        now: i64,
        request: Request,
        entries: &[WindowEntry],
    ) -> std::result::Result<Lease, StepError> {
        let outcome = self
            .inner
            .store()
            .acquire_atomic(AtomicAcquire {
                key,
                now_ms: now,
                window_ms: request.window_ms,
                limit: request.limit,
                entries,
            })
            .await
            .map_err(|e| (StoreOperation::AtomicAcquire, e))?;

        if outcome.admitted {
            return Ok(Lease::acquired());
        }

        let wait = retry_after(outcome.blocking_timestamp_ms, request.window_ms, now);
        debug!(
            key = %key,
            count = outcome.count,
            limit = request.limit,
            retry_after_ms = wait.as_millis() as u64,
            "Sliding window limit exceeded"
        );
        Ok(Lease::denied(wait))
    }
}

#[async_trait]
impl<S: AtomicOrderedStore + 'static> super::backend::PartitionLimiter
    for AtomicSlidingWindowLimiter<S>
{
    async fn try_acquire(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
    ) -> Result<Lease> {
        AtomicSlidingWindowLimiter::try_acquire(self, partition_key, permit_count, window, limit)
            .await
    }

    async fn get_statistics(&self, partition_key: &str, window: Duration) -> Result<WindowStatistics> {
        AtomicSlidingWindowLimiter::get_statistics(self, partition_key, window).await
    }
}
