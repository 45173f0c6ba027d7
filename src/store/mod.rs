//! Shared ordered-timestamp store.
//!
//! The limiter only talks to the outside world through [`SharedOrderedStore`].
//! Each partition lives under one key holding members ordered by a millisecond
//! timestamp score. Production deployments use [`RedisOrderedStore`] (sorted
//! sets); tests and single-process setups use [`InMemoryOrderedStore`].

mod memory;
mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryOrderedStore;
pub use self::redis::RedisOrderedStore;

/// Errors returned by store implementations.
///
/// Every variant is considered transient by the limiter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The attempt did not finish before its deadline
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation signal fired
    #[error("store call cancelled by caller")]
    Cancelled,

    /// The store answered with data that cannot be trusted
    #[error("malformed store reply: {0}")]
    Malformed(String),

    /// Redis protocol or connection error
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Result type alias for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A single consumed permit recorded in a partition's window.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowEntry {
    /// Acquisition instant in Unix milliseconds (the score).
    pub timestamp_ms: i64,
    /// Unique member id so entries sharing a timestamp never collide.
    pub member: String,
}

impl WindowEntry {
    /// Create an entry at `timestamp_ms` with a fresh member id.
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            member: format!("{}:{}", timestamp_ms, uuid::Uuid::new_v4().simple()),
        }
    }

    /// Create `count` entries at the same instant.
    pub fn batch(timestamp_ms: i64, count: u32) -> Vec<Self> {
        (0..count).map(|_| Self::new(timestamp_ms)).collect()
    }
}

/// Store operations, used to label failures in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// Remove entries below the window start
    Trim,
    /// Count entries inside the window
    Count,
    /// Record new entries
    Add,
    /// Read the oldest blocking entries
    ReadOldest,
    /// Refresh the partition key expiry
    Expire,
    /// Single-transaction trim, count, and add
    AtomicAcquire,
    /// A whole acquisition attempt (deadline or cancellation)
    Acquire,
    /// A whole statistics attempt (deadline)
    Statistics,
}

impl StoreOperation {
    /// Get the operation name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Trim => "trim",
            StoreOperation::Count => "count",
            StoreOperation::Add => "add",
            StoreOperation::ReadOldest => "read_oldest",
            StoreOperation::Expire => "expire",
            StoreOperation::AtomicAcquire => "atomic_acquire",
            StoreOperation::Acquire => "acquire",
            StoreOperation::Statistics => "statistics",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface over the shared ordered-timestamp store.
///
/// Calls are independent round trips; nothing here is transactional.
#[async_trait]
pub trait SharedOrderedStore: Send + Sync {
    /// Append entries under `key`. Does not deduplicate across calls.
    async fn add_entries(&self, key: &str, entries: &[WindowEntry]) -> StoreResult<()>;

    /// Count entries with `min <= score <= max`.
    async fn count_in_range(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    /// Read up to `limit` entries with `min <= score <= max`, smallest score first.
    async fn read_range_ascending(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> StoreResult<Vec<WindowEntry>>;

    /// Remove entries with `score < max_exclusive`. Returns how many were removed.
    async fn remove_range_below(&self, key: &str, max_exclusive: i64) -> StoreResult<u64>;

    /// Set or refresh the time-to-live of `key`.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()>;
}

/// Arguments of a single-transaction acquisition.
#[derive(Debug, Clone)]
pub struct AtomicAcquire<'a> {
    /// Namespaced store key
    pub key: &'a str,
    /// Current instant in Unix milliseconds
    pub now_ms: i64,
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Maximum coexisting entries
    pub limit: u64,
    /// Entries to record if admitted
    pub entries: &'a [WindowEntry],
}

impl AtomicAcquire<'_> {
    /// Lowest score still inside the window.
    pub fn window_start(&self) -> i64 {
        self.now_ms - self.window_ms
    }

    /// How many entries must leave the window before `count` plus the
    /// requested permits fit under the limit.
    pub fn required_exits(&self, count: u64) -> usize {
        (count + self.entries.len() as u64).saturating_sub(self.limit) as usize
    }
}

/// Outcome of [`AtomicOrderedStore::acquire_atomic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicOutcome {
    /// Whether the entries were recorded
    pub admitted: bool,
    /// Entries in the window after the transaction
    pub count: u64,
    /// Timestamp of the entry whose exit frees enough room, when denied
    pub blocking_timestamp_ms: Option<i64>,
}

/// A store able to trim, count, and conditionally add as one indivisible step.
#[async_trait]
pub trait AtomicOrderedStore: SharedOrderedStore {
    /// Run the whole admission check server-side.
    async fn acquire_atomic(&self, request: AtomicAcquire<'_>) -> StoreResult<AtomicOutcome>;
}
