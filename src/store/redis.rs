//! Redis sorted-set backend.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info, warn};

use super::{
    AtomicAcquire, AtomicOrderedStore, AtomicOutcome, SharedOrderedStore, StoreError,
    StoreResult, WindowEntry,
};
use crate::clock::duration_millis;

/// Trim, count, and conditionally add in one server-side step.
///
/// ARGV: window start, now, exclusive trim bound, limit, permit count,
/// ttl in ms, then one member per permit. Returns `{admitted, count, blocking}`
/// where `blocking` is -1 when no entry was found.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local window_start = ARGV[1]
local now = ARGV[2]
local limit = tonumber(ARGV[4])
local permits = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', ARGV[3])
local count = redis.call('ZCOUNT', key, window_start, now)

if count + permits <= limit then
  for i = 7, #ARGV do
    redis.call('ZADD', key, now, ARGV[i])
  end
  redis.call('PEXPIRE', key, ARGV[6])
  return {1, count + permits, -1}
end

local exits = count + permits - limit
local blocking = redis.call('ZRANGEBYSCORE', key, window_start, now, 'WITHSCORES', 'LIMIT', exits - 1, 1)
local ts = -1
if #blocking >= 2 then
  ts = tonumber(blocking[2])
end
return {0, count, ts}
"#;

/// A [`SharedOrderedStore`] backed by Redis (or a protocol-compatible server).
pub struct RedisOrderedStore {
    connection_manager: ConnectionManager,
    acquire_script: Script,
}

impl std::fmt::Debug for RedisOrderedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisOrderedStore").finish_non_exhaustive()
    }
}

impl RedisOrderedStore {
    /// Connect to `url` and verify the connection with a `PING`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            StoreError::Unavailable(format!("failed to create Redis client: {}", e))
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create Redis connection manager");
            StoreError::Unavailable(format!("failed to connect: {}", e))
        })?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        info!("Connected to shared ordered store");

        Ok(Self::from_connection_manager(connection_manager))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

/// Exclusive lower-trim bound in sorted-set range syntax.
fn exclusive_bound(score: i64) -> String {
    format!("({}", score)
}

/// Reject negative counts instead of trusting them.
fn checked_count(raw: i64, operation: &str) -> StoreResult<u64> {
    u64::try_from(raw)
        .map_err(|_| StoreError::Malformed(format!("{} returned negative count {}", operation, raw)))
}

/// Scores are written as whole milliseconds; anything else is corrupted data.
fn checked_score(raw: f64) -> StoreResult<i64> {
    if !raw.is_finite() || raw.fract() != 0.0 || raw.abs() > i64::MAX as f64 {
        return Err(StoreError::Malformed(format!("invalid score {}", raw)));
    }
    Ok(raw as i64)
}

#[async_trait]
impl SharedOrderedStore for RedisOrderedStore {
    async fn add_entries(&self, key: &str, entries: &[WindowEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for entry in entries {
            cmd.arg(entry.timestamp_ms).arg(&entry.member);
        }

        let mut conn = self.conn();
        let added: i64 = cmd.query_async(&mut conn).await?;
        debug!(key = %key, added = added, "ZADD");
        Ok(())
    }

    async fn count_in_range(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        let mut conn = self.conn();
        let count: i64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        checked_count(count, "ZCOUNT")
    }

    async fn read_range_ascending(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> StoreResult<Vec<WindowEntry>> {
        let mut conn = self.conn();
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        rows.into_iter()
            .map(|(member, score)| {
                Ok(WindowEntry {
                    timestamp_ms: checked_score(score)?,
                    member,
                })
            })
            .collect()
    }

    async fn remove_range_below(&self, key: &str, max_exclusive: i64) -> StoreResult<u64> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(exclusive_bound(max_exclusive))
            .query_async(&mut conn)
            .await?;
        checked_count(removed, "ZREMRANGEBYSCORE")
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(duration_millis(ttl).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AtomicOrderedStore for RedisOrderedStore {
    async fn acquire_atomic(&self, request: AtomicAcquire<'_>) -> StoreResult<AtomicOutcome> {
        let window_start = request.window_start();

        let mut invocation = self.acquire_script.key(request.key);
        invocation
            .arg(window_start)
            .arg(request.now_ms)
            .arg(exclusive_bound(window_start))
            .arg(request.limit)
            .arg(request.entries.len())
            .arg(request.window_ms.max(1));
        for entry in request.entries {
            invocation.arg(&entry.member);
        }

        let mut conn = self.conn();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        parse_atomic_reply(&reply)
    }
}

fn parse_atomic_reply(reply: &[i64]) -> StoreResult<AtomicOutcome> {
    match *reply {
        [admitted, count, blocking] if admitted == 0 || admitted == 1 => Ok(AtomicOutcome {
            admitted: admitted == 1,
            count: checked_count(count, "acquire script")?,
            blocking_timestamp_ms: (blocking >= 0).then_some(blocking),
        }),
        _ => Err(StoreError::Malformed(format!(
            "unexpected acquire script reply {:?}",
            reply
        ))),
    }
}
