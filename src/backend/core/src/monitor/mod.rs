//! Metrics and alert loop.
//!
//! On every tick the monitor samples queue depth, limiter counters and the
//! error window, exports them as gauges, then evaluates each [`AlertRule`].
//! Between ticks it folds worker lifecycle events into the error window. It
//! only reads the stores.

pub mod alert;
pub mod snapshot;

pub use alert::{Alert, AlertCondition, AlertLog, AlertRule, AlertSeverity, Breach};
pub use snapshot::{ErrorStats, ErrorWindow, MetricsSnapshot};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AlertThresholds, MonitorConfig};
use crate::jobs::{JobStore, WorkerEvent};
use crate::limiter::LimiterRegistry;
use crate::telemetry::metrics::{AlertMetrics, JobMetrics, LimiterMetricsRecorder};

/// The built-in rules, each with `cooldown`.
pub fn default_rules(thresholds: &AlertThresholds, cooldown: Duration) -> Vec<AlertRule> {
    let queue_depth = thresholds.queue_depth;
    let queued_ratio = thresholds.limiter_queued_ratio;
    let error_rate = thresholds.error_rate;

    vec![
        AlertRule::new("queue_depth_high", AlertSeverity::Warning, cooldown, move |s| {
            let (job_type, depth) = s.deepest_queue()?;
            (depth > queue_depth).then(|| {
                Breach::new(
                    format!("Queue '{}' has {} pending jobs", job_type, depth),
                    depth as f64,
                    queue_depth as f64,
                )
            })
        }),
        AlertRule::new("limiter_queue_ratio_high", AlertSeverity::Warning, cooldown, move |s| {
            let (service, ratio) = s.busiest_limiter()?;
            (ratio > queued_ratio).then(|| {
                Breach::new(
                    format!("{:.0}% of '{}' admissions had to wait", ratio * 100.0, service),
                    ratio,
                    queued_ratio,
                )
            })
        }),
        AlertRule::new("job_error_rate_high", AlertSeverity::Critical, cooldown, move |s| {
            let rate = s.errors.rate;
            (rate > error_rate).then(|| {
                Breach::new(
                    format!(
                        "Job error rate {:.1}% over {} recent outcomes",
                        rate * 100.0,
                        s.errors.samples()
                    ),
                    rate,
                    error_rate,
                )
            })
        }),
        AlertRule::new("job_store_unavailable", AlertSeverity::Critical, cooldown, |s| {
            (!s.store_available).then(|| Breach::new("Job store is unreachable", 0.0, 1.0))
        }),
    ]
}

/// Samples state, evaluates rules and records alerts.
pub struct Monitor {
    store: Arc<dyn JobStore>,
    limiters: Arc<LimiterRegistry>,
    log: Arc<AlertLog>,
    rules: Mutex<Vec<AlertRule>>,
    errors: Mutex<ErrorWindow>,
    latest: RwLock<Option<MetricsSnapshot>>,
    interval: Duration,
}

impl Monitor {
    pub fn new(
        config: &MonitorConfig,
        store: Arc<dyn JobStore>,
        limiters: Arc<LimiterRegistry>,
        log: Arc<AlertLog>,
    ) -> Self {
        Self {
            store,
            limiters,
            log,
            rules: Mutex::new(default_rules(&config.thresholds, config.alert_cooldown())),
            errors: Mutex::new(ErrorWindow::new(
                config.error_window(),
                config.thresholds.min_error_samples,
            )),
            latest: RwLock::new(None),
            interval: config.interval(),
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.lock().push(rule);
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.lock().iter().map(|r| r.name().to_string()).collect()
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.log
    }

    /// The snapshot taken by the last tick.
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().clone()
    }

    pub fn record_event(&self, event: &WorkerEvent) {
        self.errors.lock().record(event);
    }

    /// Read the stores and the error window.
    pub async fn collect(&self) -> MetricsSnapshot {
        let (store_available, queue_depth, processing) = match self.store.queue_depths().await {
            Ok(depths) => (true, depths.pending, depths.processing),
            Err(e) => {
                warn!(error = %e, "Could not read queue depths");
                (false, Default::default(), 0)
            }
        };
        let limiters = self.limiters.metrics().await;
        let now = Utc::now();
        let errors = self.errors.lock().stats(now);

        MetricsSnapshot {
            taken_at: now,
            store_available,
            queue_depth,
            processing,
            limiters,
            errors,
        }
    }

    /// Evaluate every rule against `snapshot`, logging and recording what fires.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let now = Utc::now();
        let fired: Vec<Alert> = self
            .rules
            .lock()
            .iter_mut()
            .filter_map(|rule| rule.evaluate(snapshot, now))
            .collect();

        for alert in &fired {
            AlertMetrics::record_fired(&alert.name, alert.severity.as_str());
            match alert.severity {
                AlertSeverity::Critical => error!(
                    alert = %alert.name,
                    current_value = alert.current_value,
                    threshold = alert.threshold,
                    "{}", alert.message
                ),
                _ => warn!(
                    alert = %alert.name,
                    severity = %alert.severity,
                    current_value = alert.current_value,
                    threshold = alert.threshold,
                    "{}", alert.message
                ),
            }
            self.log.push(alert.clone());
        }
        fired
    }

    /// One loop iteration: collect, export gauges, evaluate.
    pub async fn tick(&self) -> Vec<Alert> {
        let snapshot = self.collect().await;

        for (job_type, depth) in &snapshot.queue_depth {
            JobMetrics::set_queue_depth(job_type, *depth);
        }
        for (service, metrics) in &snapshot.limiters {
            LimiterMetricsRecorder::set_queued_ratio(service, metrics.queued_ratio());
        }
        JobMetrics::set_error_rate(snapshot.errors.rate);

        let fired = self.evaluate(&snapshot);
        debug!(
            pending = snapshot.queue_depth.values().sum::<u64>(),
            processing = snapshot.processing,
            error_rate = snapshot.errors.rate,
            fired = fired.len(),
            "Monitor tick"
        );
        *self.latest.write() = Some(snapshot);
        fired
    }

    /// Tick every interval and consume worker events until `shutdown` fires.
    pub fn start(
        self: &Arc<Self>,
        events: Option<mpsc::Receiver<WorkerEvent>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        info!(interval_ms = self.interval.as_millis() as u64, "Monitor started");

        tokio::spawn(async move {
            let mut events = events;
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let mut channel_closed = false;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.tick().await;
                    }
                    event = next_event(&mut events) => match event {
                        Some(event) => monitor.record_event(&event),
                        None => channel_closed = true,
                    },
                }
                if channel_closed {
                    debug!("Worker event channel closed");
                    events = None;
                }
            }
            info!("Monitor stopped");
        })
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<WorkerEvent>>) -> Option<WorkerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("interval", &self.interval)
            .field("rules", &self.rule_names())
            .field("alerts", &self.log.len())
            .finish()
    }
}
