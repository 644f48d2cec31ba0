//! Per-key admission with FIFO waiting and fail-open semantics.
//!
//! A caller is granted at once while the key's window has room. Otherwise it
//! joins the key's wait list; a drain task sleeps until the window resets and
//! hands grants to waiters strictly in arrival order. New callers never
//! overtake a non-empty wait list.
//!
//! If the window store errors, callers are granted immediately
//! ([`Admission::Degraded`]) and the event is logged and counted.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::metrics::{AdmissionOutcome, LimiterMetrics, LimiterMetricsStore, LocalCounters};
use super::window::{InMemoryWindowStore, WindowDecision, WindowStore};
use crate::config::RateLimitSettings;
use crate::error::{RelayError, Result};
use crate::limiter::metrics::InMemoryLimiterMetricsStore;
use crate::telemetry::metrics::LimiterMetricsRecorder;

const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(300);

/// How a caller was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "admission", rename_all = "snake_case")]
pub enum Admission {
    /// The window had room
    Immediate,
    /// Granted at a later window boundary
    Queued { waited: Duration },
    /// The window store was unreachable; granted without a check
    Degraded,
}

impl Admission {
    pub fn waited(&self) -> Duration {
        match self {
            Self::Queued { waited } => *waited,
            _ => Duration::ZERO,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Clock
// ═══════════════════════════════════════════════════════════════════════════════

/// Wall-clock milliseconds advanced by the Tokio clock, so window math and
/// timer wakeups agree (including under a paused test clock).
#[derive(Debug, Clone, Copy)]
pub(crate) struct LimiterClock {
    origin: Instant,
    origin_ms: i64,
}

impl LimiterClock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_ms: Utc::now().timestamp_millis(),
        }
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.origin_ms + self.origin.elapsed().as_millis() as i64
    }

    fn instant_at(&self, at_ms: i64) -> Instant {
        let offset = at_ms.saturating_sub(self.origin_ms).max(0) as u64;
        self.origin + Duration::from_millis(offset)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Slots
// ═══════════════════════════════════════════════════════════════════════════════

enum Grant {
    Window,
    Degraded,
}

enum Waited {
    Granted(Grant),
    Aborted,
    Dropped,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

struct SlotState {
    waiters: VecDeque<Waiter>,
    draining: bool,
    last_used: Instant,
}

/// In-process state for one key.
struct KeySlot {
    state: Mutex<SlotState>,
}

impl KeySlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                waiters: VecDeque::new(),
                draining: false,
                last_used: Instant::now(),
            }),
        }
    }

    fn remove(&self, id: u64) {
        self.state.lock().waiters.retain(|w| w.id != id);
    }

    /// Hand `grant` to the oldest waiter still listening.
    fn grant_next(&self, mut grant: Grant) -> bool {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return true,
                Err(returned) => grant = returned,
            }
        }
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Admission limiter for one tracked service.
pub struct AdmissionLimiter {
    service: String,
    settings: RateLimitSettings,
    windows: Arc<dyn WindowStore>,
    metrics: Arc<dyn LimiterMetricsStore>,
    local: LocalCounters,
    slots: DashMap<String, Arc<KeySlot>>,
    clock: LimiterClock,
    next_waiter: AtomicU64,
    idle_eviction: Duration,
}

impl AdmissionLimiter {
    pub fn new(
        service: impl Into<String>,
        settings: RateLimitSettings,
        windows: Arc<dyn WindowStore>,
        metrics: Arc<dyn LimiterMetricsStore>,
        idle_eviction: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: service.into(),
            settings,
            windows,
            metrics,
            local: LocalCounters::default(),
            slots: DashMap::new(),
            clock: LimiterClock::new(),
            next_waiter: AtomicU64::new(0),
            idle_eviction,
        })
    }

    /// A limiter over fresh in-memory stores.
    pub fn in_memory(service: impl Into<String>, settings: RateLimitSettings) -> Arc<Self> {
        Self::new(
            service,
            settings,
            Arc::new(InMemoryWindowStore::new()),
            Arc::new(InMemoryLimiterMetricsStore::new()),
            DEFAULT_IDLE_EVICTION,
        )
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    /// Wait until `key` may proceed. Never fails.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> Admission {
        self.admit(key, std::future::pending::<()>())
            .await
            .unwrap_or(Admission::Degraded)
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    pub async fn acquire_timeout(self: &Arc<Self>, key: &str, timeout: Duration) -> Result<Admission> {
        self.admit(key, tokio::time::sleep(timeout))
            .await
            .ok_or_else(|| RelayError::acquire_timeout(key, timeout))
    }

    /// Like [`acquire`](Self::acquire), giving up when `cancel` fires.
    pub async fn acquire_cancellable(
        self: &Arc<Self>,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<Admission> {
        self.admit(key, cancel.cancelled_owned())
            .await
            .ok_or_else(|| RelayError::acquire_cancelled(key))
    }

    /// Callers currently queued on `key`.
    pub fn waiting(&self, key: &str) -> usize {
        self.slots
            .get(key)
            .map(|slot| slot.state.lock().waiters.len())
            .unwrap_or(0)
    }

    /// Keys with in-process state.
    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }

    /// Counters from the shared store, or this process's when it is unreachable.
    pub async fn metrics(&self) -> LimiterMetrics {
        match self.metrics.snapshot(&self.service).await {
            Ok(metrics) => metrics,
            Err(e) => {
                debug!(service = %self.service, error = %e, "Limiter metrics store unreachable, using local counters");
                self.local.snapshot()
            }
        }
    }

    /// Drop idle keys with no waiters. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let before = self.slots.len();
        let idle = self.idle_eviction;
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let state = slot.state.lock();
            !(state.waiters.is_empty() && !state.draining && state.last_used.elapsed() >= idle)
        });
        before.saturating_sub(self.slots.len())
    }

    /// Drop expired windows from stores without native TTLs.
    pub async fn purge_windows(&self) -> Result<usize> {
        self.windows.purge_expired(self.clock.now_ms()).await
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}:{}", self.service, key)
    }

    fn slot(&self, key: &str) -> Arc<KeySlot> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeySlot::new()))
            .clone()
    }

    /// Returns `None` when `abort` completed before a grant.
    async fn admit<F>(self: &Arc<Self>, key: &str, abort: F) -> Option<Admission>
    where
        F: Future<Output = ()>,
    {
        let slot = self.slot(key);
        let queue_ahead = {
            let mut state = slot.state.lock();
            state.last_used = Instant::now();
            !state.waiters.is_empty()
        };

        let reset_at_ms = if queue_ahead {
            None
        } else {
            match self
                .windows
                .try_acquire(&self.window_key(key), self.settings.requests, self.settings.window(), self.clock.now_ms())
                .await
            {
                Ok(WindowDecision::Granted { .. }) => {
                    self.record(AdmissionOutcome::Allowed).await;
                    return Some(Admission::Immediate);
                }
                Ok(WindowDecision::Exhausted { reset_at_ms }) => Some(reset_at_ms),
                Err(e) => {
                    self.report_degraded(key, &e);
                    self.record(AdmissionOutcome::Allowed).await;
                    return Some(Admission::Degraded);
                }
            }
        };

        let started = Instant::now();
        let (id, mut rx) = self.enqueue(&slot, key, reset_at_ms);

        tokio::pin!(abort);
        let outcome = tokio::select! {
            biased;
            grant = &mut rx => match grant {
                Ok(grant) => Waited::Granted(grant),
                Err(_) => Waited::Dropped,
            },
            _ = &mut abort => {
                slot.remove(id);
                match rx.try_recv() {
                    Ok(grant) => Waited::Granted(grant),
                    Err(_) => Waited::Aborted,
                }
            }
        };

        let waited = started.elapsed();
        match outcome {
            Waited::Granted(Grant::Window) => {
                self.record(AdmissionOutcome::Queued).await;
                LimiterMetricsRecorder::record_wait(&self.service, waited);
                debug!(service = %self.service, key = %key, waited_ms = waited.as_millis() as u64, "Queued caller admitted");
                Some(Admission::Queued { waited })
            }
            Waited::Granted(Grant::Degraded) => {
                self.record(AdmissionOutcome::Queued).await;
                Some(Admission::Degraded)
            }
            Waited::Aborted => {
                debug!(service = %self.service, key = %key, "Caller left the wait list");
                None
            }
            // drain task gone (runtime shutting down)
            Waited::Dropped => {
                self.record(AdmissionOutcome::Queued).await;
                Some(Admission::Degraded)
            }
        }
    }

    fn enqueue(
        self: &Arc<Self>,
        slot: &Arc<KeySlot>,
        key: &str,
        reset_at_ms: Option<i64>,
    ) -> (u64, oneshot::Receiver<Grant>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);

        let start_drain = {
            let mut state = slot.state.lock();
            state.waiters.push_back(Waiter { id, tx });
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            tokio::spawn(self.clone().drain(key.to_string(), slot.clone(), reset_at_ms));
        }
        (id, rx)
    }

    async fn drain(self: Arc<Self>, key: String, slot: Arc<KeySlot>, first_reset_ms: Option<i64>) {
        if let Some(at) = first_reset_ms {
            tokio::time::sleep_until(self.clock.instant_at(at)).await;
        }
        let window_key = self.window_key(&key);

        loop {
            {
                let mut state = slot.state.lock();
                state.waiters.retain(|w| !w.tx.is_closed());
                if state.waiters.is_empty() {
                    state.draining = false;
                    state.last_used = Instant::now();
                    return;
                }
            }

            let now_ms = self.clock.now_ms();
            match self
                .windows
                .try_acquire(&window_key, self.settings.requests, self.settings.window(), now_ms)
                .await
            {
                Ok(WindowDecision::Granted { .. }) => {
                    slot.grant_next(Grant::Window);
                }
                Ok(WindowDecision::Exhausted { reset_at_ms }) => {
                    let wake = self.clock.instant_at(reset_at_ms.max(now_ms + 1));
                    tokio::time::sleep_until(wake).await;
                }
                Err(e) => {
                    self.report_degraded(&key, &e);
                    let waiters: Vec<Waiter> = slot.state.lock().waiters.drain(..).collect();
                    for waiter in waiters {
                        let _ = waiter.tx.send(Grant::Degraded);
                    }
                }
            }
        }
    }

    async fn record(&self, outcome: AdmissionOutcome) {
        self.local.record(outcome);
        LimiterMetricsRecorder::record_admission(&self.service, outcome.as_str());
        if let Err(e) = self.metrics.increment(&self.service, outcome).await {
            debug!(service = %self.service, error = %e, "Failed to record limiter metric");
        }
    }

    fn report_degraded(&self, key: &str, error: &RelayError) {
        LimiterMetricsRecorder::record_degraded(&self.service);
        warn!(
            service = %self.service,
            key = %key,
            error = %error,
            "Limiter store unavailable, failing open"
        );
    }
}

impl std::fmt::Debug for AdmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLimiter")
            .field("service", &self.service)
            .field("settings", &self.settings)
            .field("tracked_keys", &self.slots.len())
            .finish()
    }
}
