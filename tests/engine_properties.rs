//! End-to-end behaviour of the rate limiting engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use bulwark::clock::ManualClock;
use bulwark::ratelimit::{
    AttackType, HitOutcome, RateLimitEngine, RateLimitRule, SecurityEventKind, WindowCounter,
};
use bulwark::store::{CounterStore, MemoryCounterStore, StoreError, StoreResult};

const MINUTE_MS: u64 = 60 * 1000;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryCounterStore>,
    engine: Arc<RateLimitEngine>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
    let engine = Arc::new(RateLimitEngine::with_clock(store.clone(), clock.clone()));
    Harness {
        clock,
        store,
        engine,
    }
}

fn add_rule(engine: &RateLimitEngine, name: &str, window_ms: u64, max_requests: u64) {
    engine
        .add_rule(RateLimitRule::new(name, window_ms, max_requests).unwrap())
        .unwrap();
}

#[tokio::test]
async fn threshold_denies_after_max_requests() {
    let h = harness();
    add_rule(&h.engine, "three", MINUTE_MS, 3);

    for expected_remaining in [2, 1, 0] {
        let result = h.engine.check_limit("three", "client", None).await;
        assert!(result.allowed);
        assert_eq!(result.limit_info.unwrap().remaining_points, expected_remaining);
    }

    let denied = h.engine.check_limit("three", "client", None).await;
    assert!(!denied.allowed);
    assert!(denied.retry_after.unwrap() > 0);
    assert!(denied.block_reason.is_none());
}

#[tokio::test]
async fn window_rollover_restores_full_allowance() {
    let h = harness();
    add_rule(&h.engine, "three", MINUTE_MS, 3);

    for _ in 0..4 {
        h.engine.check_limit("three", "client", None).await;
    }
    h.clock.advance(MINUTE_MS);

    let result = h.engine.check_limit("three", "client", None).await;
    assert!(result.allowed);
    let info = result.limit_info.unwrap();
    assert!(info.is_first_in_window);
    assert_eq!(info.remaining_points, 2);
}

#[tokio::test]
async fn block_takes_precedence_over_rule_state() {
    let h = harness();
    h.engine.block_identifier("client", 5_000, "test").unwrap();

    for rule in ["api_general", "auth_login", "nonexistent_rule"] {
        let result = h.engine.check_limit(rule, "client", None).await;
        assert!(!result.allowed);
        assert_eq!(result.block_reason.as_deref(), Some("test"));
        assert_eq!(result.retry_after, Some(5));
    }
    // Blocked checks never reach the counter store
    assert!(h.store.is_empty());

    h.clock.advance(5_000);
    let result = h.engine.check_limit("api_general", "client", None).await;
    assert!(result.allowed);
    assert!(result.limit_info.unwrap().is_first_in_window);
}

struct UnavailableStore;

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<WindowCounter>> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _record: &WindowCounter, _ttl: Duration) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn hit(&self, _key: &str, _now: u64, _window: u64, _max: u64) -> StoreResult<HitOutcome> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn store_failure_fails_open() {
    let engine = RateLimitEngine::new(Arc::new(UnavailableStore));

    for _ in 0..20 {
        let result = engine.check_limit("auth_login", "client", None).await;
        assert!(result.allowed);
    }

    let stats = engine.get_stats();
    assert_eq!(stats.total_requests, 20);
    assert_eq!(stats.blocked_requests, 0);
}

#[tokio::test]
async fn brute_force_on_login_blocks_identifier() {
    let h = harness();
    let mut events = h.engine.subscribe();

    for _ in 0..5 {
        assert!(h.engine.check_limit("auth_login", "attacker", None).await.allowed);
    }

    let breach = h.engine.check_limit("auth_login", "attacker", None).await;
    assert!(!breach.allowed);
    assert_eq!(breach.breach.unwrap().escalation, Some(AttackType::BruteForce));

    let first = events.recv().await.unwrap();
    assert_eq!(first.kind, SecurityEventKind::AttackDetected);
    assert_eq!(first.attack_type, AttackType::BruteForce);
    assert!(first.blocked);

    let next = h.engine.check_limit("auth_login", "attacker", None).await;
    assert!(!next.allowed);
    assert!(next.block_reason.unwrap().contains("BRUTE_FORCE_DETECTED"));
    assert_eq!(next.retry_after, Some(30 * 60));

    // Block outlives the login window
    h.clock.advance(29 * MINUTE_MS);
    assert!(h.engine.check_blocked("attacker").is_some());
    h.clock.advance(MINUTE_MS);
    assert!(h.engine.check_blocked("attacker").is_none());
}

#[tokio::test]
async fn stats_track_allowed_and_denied_calls() {
    let h = harness();
    add_rule(&h.engine, "one", MINUTE_MS, 1);
    add_rule(&h.engine, "two", MINUTE_MS, 2);

    // 3 allowed, 3 denied across two rules
    h.engine.check_limit("one", "a", None).await;
    h.engine.check_limit("one", "a", None).await;
    h.engine.check_limit("one", "a", None).await;
    h.engine.check_limit("two", "a", None).await;
    h.engine.check_limit("two", "a", None).await;
    h.engine.check_limit("two", "a", None).await;

    let stats = h.engine.get_stats();
    assert_eq!(stats.total_requests, 6);
    assert_eq!(stats.blocked_requests, 3);
    assert_eq!(stats.rules_triggered["one"], 2);
    assert_eq!(stats.rules_triggered["two"], 1);
    assert!((stats.block_rate - 0.5).abs() < f64::EPSILON);

    h.engine.block_identifier("blocked", 5_000, "test").unwrap();
    h.engine.reset_stats();

    let stats = h.engine.get_stats();
    assert_eq!(stats.total_requests, 0);
    assert_eq!(stats.blocked_requests, 0);
    assert!(stats.rules_triggered.values().all(|count| *count == 0));
    assert_eq!(stats.active_blocks, 1);

    let result = h.engine.check_limit("api_general", "blocked", None).await;
    assert_eq!(result.block_reason.as_deref(), Some("test"));
}

#[tokio::test]
async fn unknown_rule_allows_without_touching_store() {
    let h = harness();
    let result = h.engine.check_limit("nonexistent_rule", "client", None).await;
    assert!(result.allowed);
    assert!(result.limit_info.is_none());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn unblock_is_idempotent() {
    let h = harness();
    assert!(!h.engine.unblock_identifier("never-blocked"));

    let result = h.engine.check_limit("api_general", "never-blocked", None).await;
    assert!(result.allowed);

    h.engine.block_identifier("client", MINUTE_MS, "test").unwrap();
    assert!(h.engine.unblock_identifier("client"));
    assert!(!h.engine.unblock_identifier("client"));
    assert!(h.engine.check_limit("api_general", "client", None).await.allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_admits_exactly_max() {
    let h = harness();
    add_rule(&h.engine, "burst", MINUTE_MS, 5);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.check_limit("burst", "client", None).await })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let allowed = results
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|result| result.allowed)
        .count();
    assert_eq!(allowed, 5);
}

#[tokio::test]
async fn identifiers_do_not_share_counters() {
    let h = harness();
    add_rule(&h.engine, "one", MINUTE_MS, 1);

    assert!(h.engine.check_limit("one", "a", None).await.allowed);
    assert!(h.engine.check_limit("one", "b", None).await.allowed);
    assert!(!h.engine.check_limit("one", "a", None).await.allowed);
    assert_eq!(h.store.len(), 2);
}
