//! Fixed token windows and the stores that hold them.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::Script;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::RedisBackend;
use crate::error::{RelayError, Result};

/// Request window for one key.
///
/// `count` never exceeds `limit` while the window is open; the first request
/// after `window_start_ms + window_duration_ms` opens a fresh window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitWindow {
    pub key: String,
    /// Unix milliseconds
    pub window_start_ms: i64,
    pub count: u32,
    pub limit: u32,
    pub window_duration_ms: u64,
}

impl RateLimitWindow {
    /// Open a window holding its first request.
    pub fn open(key: impl Into<String>, limit: u32, window: Duration, now_ms: i64) -> Self {
        Self {
            key: key.into(),
            window_start_ms: now_ms,
            count: 1,
            limit,
            window_duration_ms: window.as_millis() as u64,
        }
    }

    pub fn reset_at_ms(&self) -> i64 {
        self.window_start_ms
            .saturating_add(self.window_duration_ms.min(i64::MAX as u64) as i64)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.reset_at_ms()
    }

    /// Count one request against the window, resetting it when expired.
    pub fn admit(&mut self, now_ms: i64) -> bool {
        if self.is_expired(now_ms) {
            self.window_start_ms = now_ms;
            self.count = 1;
            true
        } else if self.count < self.limit {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Result of counting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowDecision {
    Granted { window: RateLimitWindow },
    /// Full until `reset_at_ms`
    Exhausted { reset_at_ms: i64 },
}

impl WindowDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Atomic increment-and-check over per-key windows.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> Result<WindowDecision>;

    /// Drop windows that have expired. Stores with native TTLs do nothing.
    async fn purge_expired(&self, _now_ms: i64) -> Result<usize> {
        Ok(0)
    }

    async fn ping(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local window store.
#[derive(Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<String, RateLimitWindow>,
    unavailable: AtomicBool,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn window(&self, key: &str) -> Option<RateLimitWindow> {
        self.windows.get(key).map(|w| w.clone())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RelayError::limiter_store_unavailable("in-memory window store is offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> Result<WindowDecision> {
        self.check_available()?;

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateLimitWindow {
                key: key.to_string(),
                window_start_ms: i64::MIN,
                count: 0,
                limit,
                window_duration_ms: window.as_millis() as u64,
            });
        let current = entry.value_mut();
        current.limit = limit;
        current.window_duration_ms = window.as_millis() as u64;

        if current.admit(now_ms) {
            Ok(WindowDecision::Granted {
                window: current.clone(),
            })
        } else {
            Ok(WindowDecision::Exhausted {
                reset_at_ms: current.reset_at_ms(),
            })
        }
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        self.check_available()?;
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(now_ms));
        Ok(before.saturating_sub(self.windows.len()))
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

// KEYS: window hash
// ARGV: limit, window_ms, now_ms
const TRY_ACQUIRE: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local f = redis.call('HMGET', KEYS[1], 'start', 'count')
local start = tonumber(f[1])
local count = tonumber(f[2])

if (not start) or now >= start + window then
  redis.call('HSET', KEYS[1], 'start', now, 'count', 1)
  redis.call('PEXPIRE', KEYS[1], window * 2)
  return {1, now, 1}
end

if count < limit then
  count = redis.call('HINCRBY', KEYS[1], 'count', 1)
  return {1, start, count}
end

return {0, start, count}
"#;

/// Window store shared by every instance pointed at the same Redis.
///
/// Windows live in `{prefix}:limiter:window:{key}` and expire two window
/// lengths after they open.
pub struct RedisWindowStore {
    backend: Arc<RedisBackend>,
    script: Script,
}

impl RedisWindowStore {
    pub fn new(backend: Arc<RedisBackend>) -> Self {
        Self {
            backend,
            script: Script::new(TRY_ACQUIRE),
        }
    }

    fn window_key(&self, key: &str) -> String {
        self.backend.key(&["limiter", "window", key])
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> Result<WindowDecision> {
        let mut conn = self.backend.connection().await?;
        let window_ms = window.as_millis() as u64;

        let (granted, start, count): (i64, i64, u32) = self
            .script
            .key(self.window_key(key))
            .arg(limit)
            .arg(window_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        let current = RateLimitWindow {
            key: key.to_string(),
            window_start_ms: start,
            count,
            limit,
            window_duration_ms: window_ms,
        };

        if granted == 1 {
            Ok(WindowDecision::Granted { window: current })
        } else {
            Ok(WindowDecision::Exhausted {
                reset_at_ms: current.reset_at_ms(),
            })
        }
    }

    async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
