//! Integration tests for the metrics and alert loop.
//!
//! Tests cover:
//! - Built-in rules against live queue and limiter state
//! - Error-rate window fed by worker events
//! - Custom rules and cooldown
//! - Alert log cap
//! - The background loop

use async_trait::async_trait;
use chrono::Utc;
use relay_core::config::{LimiterConfig, MonitorConfig, RateLimitSettings};
use relay_core::jobs::{
    EventPublisher, InMemoryJobStore, JobContext, JobError, JobHandler, JobId, JobProducer,
    JobResult, JobWorker, RetryPolicy, WorkerEvent,
};
use relay_core::limiter::LimiterRegistry;
use relay_core::monitor::{AlertLog, AlertRule, AlertSeverity, Breach, Monitor};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fails;

#[async_trait]
impl JobHandler for Fails {
    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        Err(JobError::fatal("rejected by upstream"))
    }
}

fn fixture(config: &MonitorConfig) -> (Arc<Monitor>, Arc<InMemoryJobStore>, Arc<LimiterRegistry>) {
    let store = Arc::new(InMemoryJobStore::new());
    let mut limiter_config = LimiterConfig::default();
    limiter_config
        .services
        .insert("fax-api".to_string(), RateLimitSettings { requests: 1, window_ms: 60_000 });
    let limiters = Arc::new(LimiterRegistry::in_memory(&limiter_config));
    let monitor = Arc::new(Monitor::new(
        config,
        store.clone(),
        limiters.clone(),
        Arc::new(AlertLog::new(config.max_alerts)),
    ));
    (monitor, store, limiters)
}

fn failed_event() -> WorkerEvent {
    WorkerEvent::Failed {
        job_id: JobId::new(),
        job_type: "fax".to_string(),
        attempts: 3,
        error: "modem busy".to_string(),
        at: Utc::now(),
    }
}

// ============================================================================
// Built-in Rules
// ============================================================================

#[tokio::test]
async fn test_quiet_system_fires_nothing() {
    let (monitor, _, _) = fixture(&MonitorConfig::default());

    assert!(monitor.tick().await.is_empty());
    let snapshot = monitor.latest().unwrap();
    assert!(snapshot.store_available);
    assert_eq!(snapshot.errors.rate, 0.0);
    assert!(snapshot.limiters.contains_key("fax-api"));
}

#[tokio::test]
async fn test_error_rate_alert_from_worker_events() {
    let mut config = MonitorConfig::default();
    config.thresholds.min_error_samples = 2;
    let (monitor, store, _) = fixture(&config);

    let (events, mut rx) = EventPublisher::channel(32);
    let producer = JobProducer::new(store.clone(), 3);
    let worker = JobWorker::builder(store)
        .retry_policy(RetryPolicy::new(Duration::ZERO, Duration::ZERO))
        .handler("fax", Arc::new(Fails))
        .events(events)
        .build();

    for i in 0..3 {
        producer.enqueue("fax", &format!("fax-{}", i), &json!({})).await.unwrap();
        worker.process_next().await.unwrap();
    }
    while let Ok(event) = rx.try_recv() {
        monitor.record_event(&event);
    }

    let fired = monitor.tick().await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].name, "job_error_rate_high");
    assert_eq!(fired[0].severity, AlertSeverity::Critical);
    assert_eq!(fired[0].current_value, 1.0);
    assert_eq!(monitor.latest().unwrap().errors.failed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_limiter_queue_ratio_alert() {
    let mut config = MonitorConfig::default();
    config.thresholds.limiter_queued_ratio = 0.4;
    let (monitor, _, limiters) = fixture(&config);
    let fax = limiters.get("fax-api").unwrap();

    fax.acquire("acme").await;
    let waiter = {
        let fax = fax.clone();
        tokio::spawn(async move { fax.acquire("acme").await })
    };
    waiter.await.unwrap();

    let fired = monitor.tick().await;
    let alert = fired
        .iter()
        .find(|a| a.name == "limiter_queue_ratio_high")
        .expect("limiter alert");
    assert_eq!(alert.current_value, 0.5);
    assert!(alert.message.contains("fax-api"));
}

// ============================================================================
// Custom Rules & Log
// ============================================================================

#[tokio::test]
async fn test_custom_rule_respects_cooldown() {
    let (monitor, _, _) = fixture(&MonitorConfig::default());
    monitor.add_rule(AlertRule::new(
        "always_on",
        AlertSeverity::Info,
        Duration::from_secs(3600),
        |_| Some(Breach::new("heartbeat", 1.0, 0.0)),
    ));

    assert_eq!(monitor.tick().await.len(), 1);
    assert!(monitor.tick().await.is_empty());
    assert!(monitor.tick().await.is_empty());
    assert_eq!(monitor.alerts().len(), 1);
    assert!(monitor.rule_names().contains(&"always_on".to_string()));
}

#[tokio::test]
async fn test_alert_log_keeps_newest_entries() {
    let mut config = MonitorConfig::default();
    config.max_alerts = 3;
    let (monitor, _, _) = fixture(&config);
    for i in 0..5 {
        monitor.add_rule(AlertRule::new(
            format!("rule_{}", i),
            AlertSeverity::Warning,
            Duration::from_secs(3600),
            |_| Some(Breach::new("on", 1.0, 0.0)),
        ));
    }

    assert_eq!(monitor.tick().await.len(), 5);
    let names: Vec<String> = monitor.alerts().list().into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["rule_2", "rule_3", "rule_4"]);
    assert_eq!(monitor.alerts().clear(), 3);
}

// ============================================================================
// Loop
// ============================================================================

#[tokio::test]
async fn test_loop_consumes_events_and_stops_on_cancel() {
    let mut config = MonitorConfig::default();
    config.interval_ms = 20;
    config.thresholds.min_error_samples = 1;
    let (monitor, _, _) = fixture(&config);

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let task = monitor.start(Some(rx), shutdown.clone());

    tx.send(failed_event()).await.unwrap();
    drop(tx);

    let mut fired = false;
    for _ in 0..100 {
        if monitor.alerts().list().iter().any(|a| a.name == "job_error_rate_high") {
            fired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(fired);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("monitor stops")
        .unwrap();
}
