//! Admission counters per service.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::RedisBackend;
use crate::error::{RelayError, Result};

/// Monotonic admission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterMetrics {
    /// Granted without waiting
    pub allowed: u64,
    /// Granted after waiting in the FIFO list
    pub queued: u64,
    /// Always 0: the limiter never rejects
    pub rejected: u64,
}

impl LimiterMetrics {
    pub fn total(&self) -> u64 {
        self.allowed + self.queued + self.rejected
    }

    /// `queued / (allowed + queued + rejected)`, 0 when nothing was admitted.
    pub fn queued_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.queued as f64 / total as f64,
        }
    }

    fn add(&mut self, outcome: AdmissionOutcome) {
        match outcome {
            AdmissionOutcome::Allowed => self.allowed += 1,
            AdmissionOutcome::Queued => self.queued += 1,
            AdmissionOutcome::Rejected => self.rejected += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionOutcome {
    Allowed,
    Queued,
    Rejected,
}

impl AdmissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Queued => "queued",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for AdmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters that live in the shared store, retained for a bounded period.
#[async_trait]
pub trait LimiterMetricsStore: Send + Sync {
    async fn increment(&self, service: &str, outcome: AdmissionOutcome) -> Result<()>;

    async fn snapshot(&self, service: &str) -> Result<LimiterMetrics>;

    async fn ping(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// Counters kept in the process, used when the shared store cannot be read.
#[derive(Debug, Default)]
pub(crate) struct LocalCounters {
    allowed: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
}

impl LocalCounters {
    pub(crate) fn record(&self, outcome: AdmissionOutcome) {
        let counter = match outcome {
            AdmissionOutcome::Allowed => &self.allowed,
            AdmissionOutcome::Queued => &self.queued,
            AdmissionOutcome::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LimiterMetrics {
        LimiterMetrics {
            allowed: self.allowed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryLimiterMetricsStore {
    counters: DashMap<String, LimiterMetrics>,
    unavailable: AtomicBool,
}

impl InMemoryLimiterMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RelayError::limiter_store_unavailable("in-memory metrics store is offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LimiterMetricsStore for InMemoryLimiterMetricsStore {
    async fn increment(&self, service: &str, outcome: AdmissionOutcome) -> Result<()> {
        self.check_available()?;
        self.counters
            .entry(service.to_string())
            .or_default()
            .add(outcome);
        Ok(())
    }

    async fn snapshot(&self, service: &str) -> Result<LimiterMetrics> {
        self.check_available()?;
        Ok(self
            .counters
            .get(service)
            .map(|m| *m)
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis
// ═══════════════════════════════════════════════════════════════════════════════

// KEYS: metrics hash
// ARGV: field, ttl_secs
const INCREMENT: &str = r#"
local value = redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

/// Counters in `{prefix}:limiter:metrics:{service}`, expiring `ttl` after
/// the first write of each retention period.
pub struct RedisLimiterMetricsStore {
    backend: Arc<RedisBackend>,
    ttl: Duration,
    script: Script,
}

impl RedisLimiterMetricsStore {
    pub fn new(backend: Arc<RedisBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            script: Script::new(INCREMENT),
        }
    }

    fn metrics_key(&self, service: &str) -> String {
        self.backend.key(&["limiter", "metrics", service])
    }
}

#[async_trait]
impl LimiterMetricsStore for RedisLimiterMetricsStore {
    async fn increment(&self, service: &str, outcome: AdmissionOutcome) -> Result<()> {
        let mut conn = self.backend.connection().await?;
        let _: i64 = self
            .script
            .key(self.metrics_key(service))
            .arg(outcome.as_str())
            .arg(self.ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn snapshot(&self, service: &str) -> Result<LimiterMetrics> {
        let mut conn = self.backend.connection().await?;
        let fields: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(self.metrics_key(service))
            .query_async(&mut conn)
            .await?;

        let read = |outcome: AdmissionOutcome| fields.get(outcome.as_str()).copied().unwrap_or(0);
        Ok(LimiterMetrics {
            allowed: read(AdmissionOutcome::Allowed),
            queued: read(AdmissionOutcome::Queued),
            rejected: read(AdmissionOutcome::Rejected),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
