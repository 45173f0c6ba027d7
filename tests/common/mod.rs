//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Barrier;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use slidegate::clock::ManualClock;
use slidegate::store::{
    AtomicAcquire, AtomicOrderedStore, AtomicOutcome, InMemoryOrderedStore, SharedOrderedStore,
    StoreError, StoreOperation, StoreResult, WindowEntry,
};

pub const NOW: i64 = 1_700_000_000_000;
pub const MINUTE: Duration = Duration::from_secs(60);

/// Target of the failure policy's degraded-dependency events.
pub const FAILURE_TARGET: &str = "slidegate::ratelimit::failure";

/// An in-memory store that can be told to fail, hang, or hold callers at the
/// count step until several of them have arrived.
pub struct FaultyStore {
    inner: InMemoryOrderedStore,
    failing: Mutex<HashSet<StoreOperation>>,
    fail_all: AtomicBool,
    hang: AtomicBool,
    count_barrier: Mutex<Option<Arc<Barrier>>>,
    barrier_uses: AtomicUsize,
    calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: InMemoryOrderedStore::with_clock(clock),
            failing: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            count_barrier: Mutex::new(None),
            barrier_uses: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &InMemoryOrderedStore {
        &self.inner
    }

    /// Fail every call of `operation`.
    pub fn fail_on(&self, operation: StoreOperation) {
        self.failing.lock().insert(operation);
    }

    /// Fail every call.
    pub fn fail_everything(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Never answer.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Hold the next `callers` count calls until all of them have counted.
    pub fn race_counts(&self, callers: usize) {
        *self.count_barrier.lock() = Some(Arc::new(Barrier::new(callers)));
        self.barrier_uses.store(callers, Ordering::SeqCst);
    }

    /// Store calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn check(&self, operation: StoreOperation) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().contains(&operation) {
            return Err(StoreError::Unavailable(format!(
                "injected {} failure",
                operation
            )));
        }
        Ok(())
    }

    async fn wait_at_count(&self) {
        let claimed = self
            .barrier_uses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !claimed {
            return;
        }
        let barrier = self.count_barrier.lock().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
    }
}

#[async_trait]
impl SharedOrderedStore for FaultyStore {
    async fn add_entries(&self, key: &str, entries: &[WindowEntry]) -> StoreResult<()> {
        self.check(StoreOperation::Add).await?;
        self.inner.add_entries(key, entries).await
    }

    async fn count_in_range(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.check(StoreOperation::Count).await?;
        let count = self.inner.count_in_range(key, min, max).await?;
        self.wait_at_count().await;
        Ok(count)
    }

    async fn read_range_ascending(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> StoreResult<Vec<WindowEntry>> {
        self.check(StoreOperation::ReadOldest).await?;
        self.inner.read_range_ascending(key, min, max, limit).await
    }

    async fn remove_range_below(&self, key: &str, max_exclusive: i64) -> StoreResult<u64> {
        self.check(StoreOperation::Trim).await?;
        self.inner.remove_range_below(key, max_exclusive).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.check(StoreOperation::Expire).await?;
        self.inner.set_expiry(key, ttl).await
    }
}

#[async_trait]
impl AtomicOrderedStore for FaultyStore {
    async fn acquire_atomic(&self, request: AtomicAcquire<'_>) -> StoreResult<AtomicOutcome> {
        self.check(StoreOperation::AtomicAcquire).await?;
        self.inner.acquire_atomic(request).await
    }
}

/// Counts WARN events emitted by the failure policy.
#[derive(Clone, Default)]
pub struct FailureLogCounter {
    count: Arc<AtomicUsize>,
}

impl FailureLogCounter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for FailureLogCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() == Level::WARN && metadata.target() == FAILURE_TARGET {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Capture failure-policy events on this thread until the guard drops.
pub fn capture_failure_logs() -> (FailureLogCounter, DefaultGuard) {
    let counter = FailureLogCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (counter, guard)
}

/// Store key of a partition under the default namespace.
pub fn store_key(partition: &str) -> String {
    format!("slidegate:{}", partition)
}

/// Seed `partition` with one entry per timestamp.
pub async fn seed(store: &InMemoryOrderedStore, partition: &str, timestamps: &[i64]) {
    let entries: Vec<_> = timestamps.iter().map(|ts| WindowEntry::new(*ts)).collect();
    store.add_entries(&store_key(partition), &entries).await.unwrap();
}
