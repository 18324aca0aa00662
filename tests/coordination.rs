//! End-to-end scenarios across the public API, using the in-process store.

use std::sync::Arc;
use std::time::Duration;

use coordkit::cache::TtlCache;
use coordkit::lock::LockClient;
use coordkit::ratelimit::{DistributedPeriodLimiter, LocalPeriodLimiter, PeriodLimiter, PermitState, Window};
use coordkit::store::MemoryStore;

const EXPECTED: [PermitState; 5] = [
    PermitState::Allowed,
    PermitState::Allowed,
    PermitState::HitQuota,
    PermitState::OverQuota,
    PermitState::OverQuota,
];

async fn five_takes_then_reset(limiter: &dyn PeriodLimiter) {
    let mut states = Vec::new();
    for _ in 0..5 {
        states.push(limiter.take("ip1").await.unwrap());
    }
    assert_eq!(states, EXPECTED);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(limiter.take("ip1").await.unwrap(), PermitState::Allowed);
}

#[tokio::test(start_paused = true)]
async fn local_limiter_quota_and_reset() {
    let limiter = LocalPeriodLimiter::new(5, 3).unwrap();
    five_takes_then_reset(&limiter).await;
}

#[tokio::test(start_paused = true)]
async fn distributed_limiter_quota_and_reset() {
    let store = Arc::new(MemoryStore::new());
    let limiter =
        DistributedPeriodLimiter::new(store, Window::new(5).unwrap(), 3, "REST_PERIOD_LIMIT").unwrap();
    five_takes_then_reset(&limiter).await;
}

#[tokio::test]
async fn nested_lock_single_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let client = LockClient::new(store.clone());
    let handle = client.obtain("res");

    assert!(handle.try_lock(Duration::from_secs(10)).await.unwrap());
    assert!(handle.try_lock(Duration::from_secs(10)).await.unwrap());
    assert_eq!(store.call_count(), 1);

    assert!(handle.unlock().await.unwrap());
    assert_eq!(store.get("res").as_deref(), Some(handle.token()));

    assert!(handle.unlock().await.unwrap());
    assert_eq!(store.get("res"), None);
}

#[tokio::test(start_paused = true)]
async fn cache_entry_recomputed_after_sweep() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.put("a", 1, Duration::from_secs(1));
    assert_eq!(cache.get("a", Duration::from_secs(1), || 2), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(cache.is_empty());

    let mut invoked = false;
    let value = cache.get("a", Duration::from_secs(1), || {
        invoked = true;
        2
    });
    assert!(invoked);
    assert_eq!(value, 2);
}
