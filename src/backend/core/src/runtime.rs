//! Process lifecycle: builds every component from [`Config`] and owns the
//! background tasks.
//!
//! ```rust,ignore
//! let runtime = Runtime::builder(config)
//!     .handler("fax", Arc::new(SendFax))
//!     .build()
//!     .await?;
//! runtime.start()?;
//! // ...
//! runtime.shutdown().await;
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::RedisBackend;
use crate::config::{Config, StoreBackend};
use crate::error::{ErrorCode, RelayError, Result};
use crate::health::{HealthService, JobStoreHealthChecker, LimiterStoreHealthChecker};
use crate::jobs::{
    EventPublisher, HttpDeliveryHandler, InMemoryJobStore, JobHandler, JobProducer, JobStore,
    JobWorker, RedisJobStore, RetryPolicy, ShutdownReport, WorkerConfig, WorkerEvent,
};
use crate::limiter::{
    self, InMemoryLimiterMetricsStore, InMemoryWindowStore, LimiterMetricsStore, LimiterRegistry,
    RedisLimiterMetricsStore, RedisWindowStore, WindowStore,
};
use crate::monitor::{AlertLog, Monitor};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Registers handlers before the runtime is built.
pub struct RuntimeBuilder {
    config: Config,
    handlers: Vec<(String, Arc<dyn JobHandler>)>,
}

impl RuntimeBuilder {
    /// Register a handler. Overrides a delivery route for the same job type.
    pub fn handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((job_type.into(), handler));
        self
    }

    /// Construct stores, limiters, monitor and worker. Nothing runs until
    /// [`Runtime::start`].
    pub async fn build(self) -> Result<Runtime> {
        let Self { config, handlers } = self;
        config.validate()?;

        let (store, windows, limiter_metrics) = build_stores(&config)?;
        if let Err(e) = store.ping().await {
            warn!(backend = store.backend_name(), error = %e, "Job store not reachable yet");
        }

        let limiters = Arc::new(LimiterRegistry::new(&config.limiter, windows.clone(), limiter_metrics.clone()));
        limiter::log_backends(&limiters);

        let alerts = Arc::new(AlertLog::new(config.monitor.max_alerts));
        let monitor = Arc::new(Monitor::new(&config.monitor, store.clone(), limiters.clone(), alerts.clone()));
        let (events, events_rx) = EventPublisher::channel(config.queue.event_buffer.max(1));

        let mut worker = JobWorker::builder(store.clone())
            .config(WorkerConfig::from_queue_config(&config.queue))
            .retry_policy(RetryPolicy::from_config(&config.queue))
            .events(events);

        for route in &config.delivery {
            let limiter = limiters.get(&route.service).ok_or_else(|| {
                RelayError::configuration(format!(
                    "delivery route '{}' names unknown limiter service '{}'",
                    route.job_type, route.service
                ))
            })?;
            let handler = HttpDeliveryHandler::new(route, limiter)?;
            info!(job_type = %route.job_type, url = %route.url, service = %route.service, "Delivery route registered");
            worker = worker.handler(route.job_type.clone(), Arc::new(handler));
        }
        for (job_type, handler) in handlers {
            worker = worker.handler(job_type, handler);
        }
        let worker = worker.build();
        if worker.job_types().is_empty() {
            warn!("No job handlers registered; the worker will not lease anything");
        }

        let mut health = HealthService::new(config.observability.service_name.clone(), HEALTH_CHECK_TIMEOUT);
        health.register_checker(Arc::new(JobStoreHealthChecker::new(store.clone())));
        health.register_checker(Arc::new(LimiterStoreHealthChecker::new(windows, limiter_metrics)));

        Ok(Runtime {
            producer: JobProducer::new(store.clone(), config.queue.max_attempts),
            config,
            store,
            limiters,
            alerts,
            monitor,
            worker,
            health: Arc::new(health),
            events_rx: Mutex::new(Some(events_rx)),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }
}

type Stores = (Arc<dyn JobStore>, Arc<dyn WindowStore>, Arc<dyn LimiterMetricsStore>);

fn build_stores(config: &Config) -> Result<Stores> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory stores; jobs and limiter state are lost on restart");
            Ok((
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryWindowStore::new()),
                Arc::new(InMemoryLimiterMetricsStore::new()),
            ))
        }
        StoreBackend::Redis => {
            let backend = Arc::new(RedisBackend::new(&config.redis)?);
            info!(prefix = backend.prefix(), "Using Redis stores");
            Ok((
                Arc::new(RedisJobStore::new(backend.clone(), config.queue.completed_retention_secs)),
                Arc::new(RedisWindowStore::new(backend.clone())),
                Arc::new(RedisLimiterMetricsStore::new(backend, config.limiter.metrics_ttl())),
            ))
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    worker: crate::jobs::WorkerHandle,
    monitor: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

/// Every long-lived component of a Relay process.
pub struct Runtime {
    config: Config,
    store: Arc<dyn JobStore>,
    producer: JobProducer,
    limiters: Arc<LimiterRegistry>,
    alerts: Arc<AlertLog>,
    monitor: Arc<Monitor>,
    worker: JobWorker,
    health: Arc<HealthService>,
    events_rx: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            handlers: Vec::new(),
        }
    }

    /// Spawn the worker slots, the reaper, the monitor loop and limiter cleanup.
    /// A runtime starts at most once.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::new(ErrorCode::InternalError, "Runtime already started"));
        }
        let mut running = self.running.lock();

        let shutdown = CancellationToken::new();
        let worker = self.worker.start();
        let monitor = self.monitor.start(self.events_rx.lock().take(), shutdown.child_token());
        let cleanup = self.limiters.start_cleanup_task(shutdown.child_token());

        *running = Some(Running {
            shutdown,
            worker,
            monitor,
            cleanup,
        });
        info!(worker = %self.worker.id(), "Runtime started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop the worker first (bounded by the shutdown timeout), then the monitor
    /// and limiter cleanup. Returns `None` if the runtime was not running.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        let running = self.running.lock().take()?;

        let report = running.worker.shutdown().await;
        running.shutdown.cancel();
        if let Err(e) = running.monitor.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }
        if let Err(e) = running.cleanup.await {
            warn!(error = %e, "Limiter cleanup task ended abnormally");
        }

        info!(graceful = report.graceful, aborted_slots = report.aborted_slots, "Runtime stopped");
        Some(report)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn producer(&self) -> &JobProducer {
        &self.producer
    }

    pub fn limiters(&self) -> &Arc<LimiterRegistry> {
        &self.limiters
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn worker(&self) -> &JobWorker {
        &self.worker
    }

    pub fn health(&self) -> &Arc<HealthService> {
        &self.health
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("store", &self.store.backend_name())
            .field("worker", &self.worker.id())
            .field("job_types", &self.worker.job_types())
            .field("running", &self.is_running())
            .finish()
    }
}
