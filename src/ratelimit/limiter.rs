//! Sliding window limiter over a shared ordered store.
//!
//! Each consumed permit is a timestamped entry under the partition's key. An
//! acquisition trims entries older than the window, counts what is left, and
//! records new entries when they fit under the limit.
//!
//! This is a soft limiter: trim, count, and write are separate round trips,
//! so callers racing on the same partition (possibly from different
//! processes) can each see room and together overshoot the limit by up to the
//! number of racers. Use [`AtomicSlidingWindowLimiter`](super::AtomicSlidingWindowLimiter)
//! when that is not acceptable.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument, trace, warn};

use super::failure::{FailureMode, FailurePolicy};
use super::key::KeyNamespace;
use super::lease::{Lease, WindowStatistics, MIN_RETRY_AFTER};
use super::rules::{LimitRule, LimitRules};
use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterSettings, StoreConfig};
use crate::error::{Result, SlidegateError};
use crate::store::{SharedOrderedStore, StoreError, StoreOperation, WindowEntry};

/// Default deadline for one acquisition or statistics attempt.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// A store failure tagged with the step that produced it.
pub(crate) type StepError = (StoreOperation, StoreError);

/// The core limiter.
///
/// Holds no per-partition state; every decision is made against the store,
/// so instances are cheap and can be shared across tasks behind an `Arc`.
pub struct SlidingWindowLimiter<S> {
    store: Arc<S>,
    namespace: KeyNamespace,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    operation_timeout: Duration,
    rules: RwLock<LimitRules>,
}

/// A validated acquisition request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    pub permit_count: u32,
    pub window: Duration,
    pub window_ms: i64,
    pub limit: u64,
}

impl<S: SharedOrderedStore> SlidingWindowLimiter<S> {
    /// Create a limiter with default settings (fail open, 250ms deadline).
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            namespace: KeyNamespace::default(),
            clock: Arc::new(SystemClock),
            failure_policy: FailurePolicy::default(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            rules: RwLock::new(LimitRules::new()),
        }
    }

    /// Create a limiter from configuration.
    pub fn from_config(store: Arc<S>, store_config: &StoreConfig, settings: &LimiterSettings) -> Self {
        Self::new(store)
            .with_namespace(KeyNamespace::new(store_config.key_prefix.clone()))
            .with_failure_mode(settings.failure_mode)
            .with_operation_timeout(settings.operation_timeout())
    }

    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: KeyNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Choose between failing open and failing closed.
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_policy = FailurePolicy::new(mode);
        self
    }

    /// Set the default deadline of each attempt.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Install a rule set for [`try_acquire_rule`](Self::try_acquire_rule).
    pub fn with_rules(self, rules: LimitRules) -> Self {
        self.set_rules(rules);
        self
    }

    /// Replace the rule set on a live limiter.
    pub fn set_rules(&self, rules: LimitRules) {
        *self.rules.write() = rules;
    }

    /// Get the current rule set.
    pub fn rules(&self) -> LimitRules {
        self.rules.read().clone()
    }

    /// The failure policy, for reading its failure counter.
    pub fn failure_policy(&self) -> &FailurePolicy {
        &self.failure_policy
    }

    /// The key namespace partitions are stored under.
    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Try to consume `permit_count` permits of `partition_key` within
    /// `window`, allowing at most `limit` permits per window.
    ///
    /// Only caller contract violations return `Err`. Store failures are
    /// resolved by the failure policy.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn try_acquire(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
    ) -> Result<Lease> {
        self.try_acquire_within(partition_key, permit_count, window, limit, self.operation_timeout)
            .await
    }

    /// [`try_acquire`](Self::try_acquire) with a caller-supplied deadline.
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

    /// [`try_acquire`](Self::try_acquire) that gives up when `cancel` resolves.
    ///
    /// A cancelled attempt is treated like any other store failure.
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
            self.operation_timeout,
            cancel,
        )
        .await
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
        let request = match self.prepare(partition_key, permit_count, window, limit)? {
            Ok(request) => request,
            Err(lease) => return Ok(lease),
        };
        let key = self.namespace.store_key(partition_key);
        let attempt = self.acquire_steps(&key, request);
        Ok(self
            .settle_acquire(partition_key, request, attempt, timeout, cancel)
            .await)
    }

    /// Acquire using the named rule from the installed rule set.
    pub async fn try_acquire_rule(
        &self,
        partition_key: &str,
        rule_name: &str,
        permit_count: u32,
    ) -> Result<Lease> {
        let rule = self.resolve_rule(rule_name)?;
        self.try_acquire(partition_key, permit_count, rule.window(), rule.requests_per_unit)
            .await
    }

    /// Current occupancy of `partition_key`'s window.
    ///
    /// Trims expired entries but never records new ones. Store failures
    /// degrade to an empty snapshot.
    pub async fn get_statistics(
        &self,
        partition_key: &str,
        window: Duration,
    ) -> Result<WindowStatistics> {
        let window_ms = validate_window(window)?;
        let key = self.namespace.store_key(partition_key);
        let now = self.clock.now_millis();

        let steps = self.statistics_steps(&key, now - window_ms, now);

        let result = match tokio::time::timeout(self.operation_timeout, steps).await {
            Ok(result) => result,
            Err(_) => Err((
                StoreOperation::Statistics,
                StoreError::Timeout(self.operation_timeout),
            )),
        };

        Ok(match result {
            Ok(count) => {
                trace!(partition = %partition_key, count = count, "Window statistics");
                WindowStatistics::new(count, now, window_ms)
            }
            Err((operation, error)) => self.failure_policy.on_statistics_failure(
                partition_key,
                operation,
                &error,
                now,
                window_ms,
            ),
        })
    }

    /// Validate arguments. The inner `Err` carries a decision reached without
    /// touching the store.
    pub(crate) fn prepare(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
    ) -> Result<std::result::Result<Request, Lease>> {
        let window_ms = validate_window(window)?;
        if limit == 0 {
            return Err(SlidegateError::InvalidLimit(limit));
        }
        if permit_count == 0 {
            return Err(SlidegateError::InvalidPermitCount(permit_count));
        }
        if u64::from(permit_count) > limit {
            debug!(
                partition = %partition_key,
                permits = permit_count,
                limit = limit,
                "Request exceeds the limit outright; it can never be admitted"
            );
            return Ok(Err(Lease::never()));
        }

        Ok(Ok(Request {
            permit_count,
            window,
            window_ms,
            limit,
        }))
    }

    /// Run `attempt` under a deadline and `cancel`, resolving failures
    /// through the policy.
    pub(crate) async fn settle_acquire<A, F>(
        &self,
        partition_key: &str,
        request: Request,
        attempt: A,
        timeout: Duration,
        cancel: F,
    ) -> Lease
    where
        A: Future<Output = std::result::Result<Lease, StepError>>,
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, attempt) => match result {
                Ok(result) => result,
                Err(_) => Err((StoreOperation::Acquire, StoreError::Timeout(timeout))),
            },
            _ = cancel => Err((StoreOperation::Acquire, StoreError::Cancelled)),
        };

        match result {
            Ok(lease) => lease,
            Err((operation, error)) => self.failure_policy.on_acquire_failure(
                partition_key,
                operation,
                &error,
                request.window,
            ),
        }
    }

    pub(crate) fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// The default deadline of each attempt.
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub(crate) fn resolve_rule(&self, rule_name: &str) -> Result<LimitRule> {
        self.rules
            .read()
            .find(rule_name)
            .copied()
            .ok_or_else(|| SlidegateError::UnknownRule(rule_name.to_string()))
    }

    async fn acquire_steps(
        &self,
        key: &str,
        request: Request,
    ) -> std::result::Result<Lease, StepError> {
        let now = self.clock.now_millis();
        let window_start = now - request.window_ms;
        let permits = u64::from(request.permit_count);

        self.trim(key, window_start).await?;

        let count = self
            .store
            .count_in_range(key, window_start, now)
            .await
            .map_err(|e| (StoreOperation::Count, e))?;

        trace!(
            key = %key,
            count = count,
            permits = permits,
            limit = request.limit,
            "Checking sliding window"
        );

        if count + permits <= request.limit {
            let entries = WindowEntry::batch(now, request.permit_count);
            self.store
                .add_entries(key, &entries)
                .await
                .map_err(|e| (StoreOperation::Add, e))?;

            if let Err(e) = self.store.set_expiry(key, request.window).await {
                warn!(
                    key = %key,
                    operation = %StoreOperation::Expire,
                    error = %e,
                    "Failed to refresh partition expiry"
                );
            }
            return Ok(Lease::acquired());
        }

        let exits = (count + permits - request.limit) as usize;
        let oldest = self
            .store
            .read_range_ascending(key, window_start, now, exits)
            .await
            .map_err(|e| (StoreOperation::ReadOldest, e))?;

        let retry_after = retry_after(
            oldest.last().map(|e| e.timestamp_ms),
            request.window_ms,
            now,
        );

        debug!(
            key = %key,
            count = count,
            limit = request.limit,
            retry_after_ms = retry_after.as_millis() as u64,
            "Sliding window limit exceeded"
        );

        Ok(Lease::denied(retry_after))
    }

    async fn statistics_steps(
        &self,
        key: &str,
        window_start: i64,
        now: i64,
    ) -> std::result::Result<u64, StepError> {
        self.trim(key, window_start).await?;
        self.store
            .count_in_range(key, window_start, now)
            .await
            .map_err(|e| (StoreOperation::Count, e))
    }

    async fn trim(&self, key: &str, window_start: i64) -> std::result::Result<(), StepError> {
        let removed = self
            .store
            .remove_range_below(key, window_start)
            .await
            .map_err(|e| (StoreOperation::Trim, e))?;
        if removed > 0 {
            trace!(key = %key, removed = removed, "Trimmed expired entries");
        }
        Ok(())
    }
}

/// Window length in milliseconds, rejecting zero and sub-millisecond windows.
pub(crate) fn validate_window(window: Duration) -> Result<i64> {
    match i64::try_from(window.as_millis()) {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(SlidegateError::InvalidWindow(window)),
    }
}

/// Time until the entry at `blocking_ms` leaves the window.
pub(crate) fn retry_after(blocking_ms: Option<i64>, window_ms: i64, now_ms: i64) -> Duration {
    match blocking_ms {
        Some(ts) => {
            let wait = ts.saturating_add(window_ms).saturating_sub(now_ms);
            Duration::from_millis(wait.max(0) as u64).max(MIN_RETRY_AFTER)
        }
        // The blocking entries disappeared between count and read.
        None => MIN_RETRY_AFTER,
    }
}

#[async_trait]
impl<S: SharedOrderedStore + 'static> super::backend::PartitionLimiter for SlidingWindowLimiter<S> {
    async fn try_acquire(
        &self,
        partition_key: &str,
        permit_count: u32,
        window: Duration,
        limit: u64,
    ) -> Result<Lease> {
        SlidingWindowLimiter::try_acquire(self, partition_key, permit_count, window, limit).await
    }

    async fn get_statistics(&self, partition_key: &str, window: Duration) -> Result<WindowStatistics> {
        SlidingWindowLimiter::get_statistics(self, partition_key, window).await
    }
}
