//! In-memory ordered store for tests and single-process deployments.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{
    AtomicAcquire, AtomicOrderedStore, AtomicOutcome, SharedOrderedStore, StoreResult,
    WindowEntry,
};
use crate::clock::{duration_millis, Clock, SystemClock};

/// Members of one key, ordered by (score, member) like a sorted set.
#[derive(Debug, Default)]
struct Partition {
    entries: BTreeSet<(i64, String)>,
    expires_at_ms: Option<i64>,
}

impl Partition {
    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }

    fn in_range(&self, min: i64, max: i64) -> impl Iterator<Item = &(i64, String)> {
        self.entries
            .range((min, String::new())..)
            .take_while(move |(score, _)| *score <= max)
    }

    fn remove_below(&mut self, max_exclusive: i64) -> u64 {
        let kept = self.entries.split_off(&(max_exclusive, String::new()));
        let removed = self.entries.len() as u64;
        self.entries = kept;
        removed
    }

    fn insert(&mut self, entries: &[WindowEntry]) {
        for entry in entries {
            self.entries.insert((entry.timestamp_ms, entry.member.clone()));
        }
    }
}

/// A [`SharedOrderedStore`] kept in process memory.
///
/// Keys expire lazily: an expired key is dropped the next time it is touched.
/// Empty keys are dropped after a trim, matching sorted-set behaviour.
#[derive(Debug)]
pub struct InMemoryOrderedStore {
    partitions: DashMap<String, Partition>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOrderedStore {
    /// Create an empty store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            partitions: DashMap::new(),
            clock,
        }
    }

    /// Number of live entries stored under `key`, regardless of score.
    pub fn len(&self, key: &str) -> usize {
        self.purge_if_expired(key);
        self.partitions
            .get(key)
            .map(|p| p.entries.len())
            .unwrap_or(0)
    }

    /// Whether no live key is stored.
    pub fn is_empty(&self) -> bool {
        let now = self.clock.now_millis();
        self.partitions.retain(|_, p| !p.is_expired(now));
        self.partitions.is_empty()
    }

    /// Remaining time-to-live of `key`, if one is set.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.purge_if_expired(key);
        let now = self.clock.now_millis();
        let expires_at = self.partitions.get(key)?.expires_at_ms?;
        Some(Duration::from_millis((expires_at - now).max(0) as u64))
    }

    fn purge_if_expired(&self, key: &str) {
        let now = self.clock.now_millis();
        if self
            .partitions
            .remove_if(key, |_, p| p.is_expired(now))
            .is_some()
        {
            trace!(key = %key, "Dropped expired partition");
        }
    }

    fn drop_if_empty(&self, key: &str) {
        self.partitions.remove_if(key, |_, p| p.entries.is_empty());
    }
}

impl Default for InMemoryOrderedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedOrderedStore for InMemoryOrderedStore {
    async fn add_entries(&self, key: &str, entries: &[WindowEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.purge_if_expired(key);
        self.partitions
            .entry(key.to_string())
            .or_default()
            .insert(entries);
        Ok(())
    }

    async fn count_in_range(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.purge_if_expired(key);
        Ok(self
            .partitions
            .get(key)
            .map(|p| p.in_range(min, max).count() as u64)
            .unwrap_or(0))
    }

    async fn read_range_ascending(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> StoreResult<Vec<WindowEntry>> {
        self.purge_if_expired(key);
        Ok(self
            .partitions
            .get(key)
            .map(|p| {
                p.in_range(min, max)
                    .take(limit)
                    .map(|(score, member)| WindowEntry {
                        timestamp_ms: *score,
                        member: member.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_range_below(&self, key: &str, max_exclusive: i64) -> StoreResult<u64> {
        self.purge_if_expired(key);
        let removed = match self.partitions.get_mut(key) {
            Some(mut partition) => partition.remove_below(max_exclusive),
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.purge_if_expired(key);
        let expires_at = self.clock.now_millis().saturating_add(duration_millis(ttl));
        if let Some(mut partition) = self.partitions.get_mut(key) {
            partition.expires_at_ms = Some(expires_at);
        }
        Ok(())
    }
}

#[async_trait]
impl AtomicOrderedStore for InMemoryOrderedStore {
    async fn acquire_atomic(&self, request: AtomicAcquire<'_>) -> StoreResult<AtomicOutcome> {
        self.purge_if_expired(request.key);
        let window_start = request.window_start();

        // The shard write lock is held until the guard drops, so no other
        // caller can interleave between trim, count, and insert.
        let outcome = {
            let mut partition = self
                .partitions
                .entry(request.key.to_string())
                .or_default();
            partition.remove_below(window_start);
            let count = partition.in_range(window_start, request.now_ms).count() as u64;

            if count + request.entries.len() as u64 <= request.limit {
                partition.insert(request.entries);
                partition.expires_at_ms =
                    Some(request.now_ms.saturating_add(request.window_ms));
                AtomicOutcome {
                    admitted: true,
                    count: count + request.entries.len() as u64,
                    blocking_timestamp_ms: None,
                }
            } else {
                let exits = request.required_exits(count).max(1);
                let blocking = partition
                    .in_range(window_start, request.now_ms)
                    .nth(exits - 1)
                    .map(|(score, _)| *score);
                AtomicOutcome {
                    admitted: false,
                    count,
                    blocking_timestamp_ms: blocking,
                }
            }
        };

        self.drop_if_empty(request.key);
        Ok(outcome)
    }
}
