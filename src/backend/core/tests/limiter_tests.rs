//! Integration tests for the admission limiter, driven by a paused Tokio clock.
//!
//! Tests cover:
//! - Window boundaries for queued callers
//! - FIFO order within a key
//! - Per-window grant bound
//! - Key isolation
//! - Fail-open on store outage
//! - Cancellation and timeout
//! - Registry lookup

use parking_lot::Mutex;
use relay_core::config::{LimiterConfig, RateLimitSettings};
use relay_core::error::ErrorCode;
use relay_core::limiter::{
    Admission, AdmissionLimiter, InMemoryLimiterMetricsStore, InMemoryWindowStore, LimiterRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn settings(requests: u32, window_ms: u64) -> RateLimitSettings {
    RateLimitSettings { requests, window_ms }
}

fn limiter_with_store(requests: u32, window_ms: u64) -> (Arc<AdmissionLimiter>, Arc<InMemoryWindowStore>) {
    let windows = Arc::new(InMemoryWindowStore::new());
    let limiter = AdmissionLimiter::new(
        "fax-api",
        settings(requests, window_ms),
        windows.clone(),
        Arc::new(InMemoryLimiterMetricsStore::new()),
        Duration::from_secs(300),
    );
    (limiter, windows)
}

/// Spawn `count` callers on `key` in arrival order; each records `(index, elapsed, admission)`.
fn spawn_callers(
    limiter: &Arc<AdmissionLimiter>,
    key: &'static str,
    count: usize,
    start: Instant,
    grants: &Arc<Mutex<Vec<(usize, Duration, Admission)>>>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let limiter = limiter.clone();
            let grants = grants.clone();
            tokio::spawn(async move {
                let admission = limiter.acquire(key).await;
                grants.lock().push((i, start.elapsed(), admission));
            })
        })
        .collect()
}

fn within(actual: Duration, expected_ms: u64) -> bool {
    let expected = Duration::from_millis(expected_ms);
    actual >= expected && actual < expected + Duration::from_millis(50)
}

// ============================================================================
// Window & Order
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_three_rapid_requests_one_per_second() {
    let (limiter, _) = limiter_with_store(1, 1000);
    let grants = Arc::new(Mutex::new(Vec::new()));

    let start = Instant::now();
    let callers = spawn_callers(&limiter, "acme", 3, start, &grants);
    futures::future::join_all(callers).await;

    let grants = grants.lock().clone();
    assert_eq!(grants.len(), 3);
    assert_eq!(grants[0].2, Admission::Immediate);
    assert!(within(grants[0].1, 0));
    assert!(within(grants[1].1, 1000), "second grant at {:?}", grants[1].1);
    assert!(within(grants[2].1, 2000), "third grant at {:?}", grants[2].1);
    assert!(matches!(grants[2].2, Admission::Queued { .. }));

    let metrics = limiter.metrics().await;
    assert_eq!(metrics.allowed, 1);
    assert_eq!(metrics.queued, 2);
    assert_eq!(metrics.rejected, 0);
    assert!((metrics.queued_ratio() - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let (limiter, _) = limiter_with_store(1, 500);
    let grants = Arc::new(Mutex::new(Vec::new()));

    let callers = spawn_callers(&limiter, "acme", 6, Instant::now(), &grants);
    futures::future::join_all(callers).await;

    let order: Vec<usize> = grants.lock().iter().map(|(i, _, _)| *i).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_grants_per_window_never_exceed_limit() {
    let (limiter, _) = limiter_with_store(3, 1000);
    let grants = Arc::new(Mutex::new(Vec::new()));

    let callers = spawn_callers(&limiter, "acme", 10, Instant::now(), &grants);
    futures::future::join_all(callers).await;

    let grants = grants.lock().clone();
    let immediate = grants.iter().filter(|(_, _, a)| *a == Admission::Immediate).count();
    assert_eq!(immediate, 3);

    for window in 0..4u128 {
        let in_window = grants
            .iter()
            .filter(|(_, at, _)| at.as_millis() / 1000 == window)
            .count();
        assert!(in_window <= 3, "window {} granted {}", window, in_window);
    }
}

#[tokio::test(start_paused = true)]
async fn test_keys_do_not_share_windows() {
    let (limiter, _) = limiter_with_store(1, 1000);

    assert_eq!(limiter.acquire("acme").await, Admission::Immediate);
    assert_eq!(limiter.acquire("globex").await, Admission::Immediate);
    assert_eq!(limiter.tracked_keys(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_window_resets_after_idle_period() {
    let (limiter, _) = limiter_with_store(1, 1000);

    assert_eq!(limiter.acquire("acme").await, Admission::Immediate);
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(limiter.acquire("acme").await, Admission::Immediate);
}

// ============================================================================
// Fail-Open
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_store_outage_fails_open() {
    let (limiter, windows) = limiter_with_store(1, 1000);
    windows.set_available(false);

    for _ in 0..5 {
        assert_eq!(limiter.acquire("acme").await, Admission::Degraded);
    }
    assert_eq!(limiter.waiting("acme"), 0);

    let metrics = limiter.metrics().await;
    assert_eq!(metrics.allowed, 5);
    assert_eq!(metrics.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_outage_during_wait_releases_waiters() {
    let (limiter, windows) = limiter_with_store(1, 10_000);
    assert_eq!(limiter.acquire("acme").await, Admission::Immediate);

    let waiter = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire("acme").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(limiter.waiting("acme"), 1);

    windows.set_available(false);
    let start = Instant::now();
    assert_eq!(waiter.await.unwrap(), Admission::Degraded);
    assert!(start.elapsed() <= Duration::from_secs(10));

    let metrics = limiter.metrics().await;
    assert_eq!(metrics.allowed, 1);
    assert_eq!(metrics.queued, 1);
}

// ============================================================================
// Cancellation & Timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_is_removed_without_grant() {
    let (limiter, _) = limiter_with_store(1, 1000);
    assert_eq!(limiter.acquire("acme").await, Admission::Immediate);

    let cancel = CancellationToken::new();
    let cancelled = {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { limiter.acquire_cancellable("acme", cancel).await })
    };
    let next = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            (limiter.acquire("acme").await, start.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(limiter.waiting("acme"), 2);
    cancel.cancel();

    let error = cancelled.await.unwrap().unwrap_err();
    assert_eq!(error.code(), ErrorCode::AcquireCancelled);
    assert_eq!(limiter.waiting("acme"), 1);

    let (admission, waited) = next.await.unwrap();
    assert!(matches!(admission, Admission::Queued { .. }));
    assert!(within(waited, 1000));

    let metrics = limiter.metrics().await;
    assert_eq!(metrics.queued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_after_grant_window_is_not_an_error() {
    let (limiter, _) = limiter_with_store(1, 1000);
    limiter.acquire("acme").await;

    let admission = limiter
        .acquire_timeout("acme", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(within(admission.waited(), 1000));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_before_grant_fails() {
    let (limiter, _) = limiter_with_store(1, 60_000);
    limiter.acquire("acme").await;

    let error = limiter
        .acquire_timeout("acme", Duration::from_millis(250))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::AcquireTimeout);
    assert_eq!(limiter.waiting("acme"), 0);
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_registry_limiters_are_independent() {
    let mut config = LimiterConfig::default();
    config.services.insert("fax-api".to_string(), settings(2, 1000));
    let registry = LimiterRegistry::in_memory(&config);

    assert_eq!(registry.services(), vec!["default".to_string(), "fax-api".to_string()]);

    let fax = registry.get("fax-api").unwrap();
    assert_eq!(fax.acquire("acme").await, Admission::Immediate);
    assert_eq!(fax.acquire("acme").await, Admission::Immediate);
    assert_eq!(registry.default_limiter().acquire("acme").await, Admission::Immediate);

    let unknown = registry.get_or_default("sms-api");
    assert_eq!(unknown.service(), "default");

    let metrics = registry.metrics().await;
    assert_eq!(metrics["fax-api"].allowed, 2);
    assert_eq!(metrics["default"].allowed, 1);
}
