//! Concurrent callers sharing one partition.

mod common;

use std::sync::Arc;
use std::time::Duration;

use slidegate::clock::ManualClock;
use slidegate::ratelimit::{AtomicSlidingWindowLimiter, RetryAfter, SlidingWindowLimiter};
use slidegate::store::InMemoryOrderedStore;

use common::{seed, store_key, FaultyStore, MINUTE, NOW};

#[tokio::test]
async fn test_soft_limiter_can_overshoot_under_race() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(FaultyStore::new(clock.clone()));
    seed(store.inner(), "user:1", &[NOW - 1_000]).await;
    let limiter = SlidingWindowLimiter::new(store.clone()).with_clock(clock);

    // both callers count before either writes
    store.race_counts(2);
    let (a, b) = tokio::join!(
        limiter.try_acquire("user:1", 1, MINUTE, 2),
        limiter.try_acquire("user:1", 1, MINUTE, 2),
    );

    assert!(a.unwrap().is_acquired());
    assert!(b.unwrap().is_acquired());

    let stats = limiter.get_statistics("user:1", MINUTE).await.unwrap();
    assert_eq!(stats.current_count, 3);
}

#[tokio::test]
async fn test_atomic_limiter_admits_one_of_two_racers() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(FaultyStore::new(clock.clone()));
    seed(store.inner(), "user:1", &[NOW - 1_000]).await;
    let limiter = AtomicSlidingWindowLimiter::from_limiter(
        SlidingWindowLimiter::new(store.clone()).with_clock(clock),
    );

    let (a, b) = tokio::join!(
        limiter.try_acquire("user:1", 1, MINUTE, 2),
        limiter.try_acquire("user:1", 1, MINUTE, 2),
    );
    let admitted = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|lease| lease.is_acquired())
        .count();

    assert_eq!(admitted, 1);
    assert_eq!(store.inner().len(&store_key("user:1")), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_atomic_limiter_holds_across_threads() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(InMemoryOrderedStore::with_clock(clock.clone()));
    let limiter = Arc::new(AtomicSlidingWindowLimiter::from_limiter(
        SlidingWindowLimiter::new(store.clone()).with_clock(clock),
    ));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.try_acquire("user:1", 1, MINUTE, 5).await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_acquired() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 5);
    assert_eq!(store.len(&store_key("user:1")), 5);
}

#[tokio::test]
async fn test_partially_filled_window_admits() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(InMemoryOrderedStore::with_clock(clock.clone()));
    let timestamps: Vec<i64> = (0..5).map(|i| NOW - 30_000 + i * 1_000).collect();
    seed(&store, "user:1", &timestamps).await;
    let limiter = SlidingWindowLimiter::new(store.clone()).with_clock(clock);

    let lease = limiter.try_acquire("user:1", 1, MINUTE, 10).await.unwrap();

    assert!(lease.is_acquired());
    assert_eq!(store.len(&store_key("user:1")), 6);
}

#[tokio::test]
async fn test_full_window_denies_until_oldest_exits() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(InMemoryOrderedStore::with_clock(clock.clone()));
    let timestamps: Vec<i64> = (0..10).map(|i| NOW - 50_000 + i * 1_000).collect();
    seed(&store, "user:1", &timestamps).await;
    let limiter = SlidingWindowLimiter::new(store.clone()).with_clock(clock.clone());

    let lease = limiter.try_acquire("user:1", 1, MINUTE, 10).await.unwrap();
    assert!(!lease.is_acquired());
    assert_eq!(
        lease.retry_after(),
        Some(RetryAfter::After(Duration::from_secs(10)))
    );
    assert_eq!(store.len(&store_key("user:1")), 10);

    // the oldest entry leaves the window just after the hint elapses
    clock.advance(Duration::from_millis(10_001));
    let lease = limiter.try_acquire("user:1", 1, MINUTE, 10).await.unwrap();
    assert!(lease.is_acquired());
}

#[tokio::test]
async fn test_statistics_do_not_consume() {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(InMemoryOrderedStore::with_clock(clock.clone()));
    seed(&store, "user:1", &[NOW - 90_000, NOW - 20_000, NOW - 10_000]).await;
    let limiter = SlidingWindowLimiter::new(store).with_clock(clock);

    let first = limiter.get_statistics("user:1", MINUTE).await.unwrap();
    let second = limiter.get_statistics("user:1", MINUTE).await.unwrap();

    assert_eq!(first.current_count, 2);
    assert_eq!(first, second);
}
