//! Redis-backed job store.
//!
//! Layout (prefix `relay` by default):
//!
//! ```text
//! relay:job:{id}                  HASH   the job record
//! relay:idem:{len}:{type}:{key}   STRING id of the non-terminal job holding the key
//! relay:pending:{type}            ZSET   pending ids scored by run_at (ms)
//! relay:processing                ZSET   leased ids scored by lease expiry (ms)
//! relay:types                     SET    job types ever enqueued
//! ```
//!
//! Each transition runs as one Lua script, so concurrent producers, workers
//! and reapers never interleave inside a transition. Scripts derive some keys
//! from record fields, which assumes a single Redis node (or a key prefix that
//! hashes to one slot).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, Instrument};

use super::job::{Job, JobId, JobStatus, LeaseToken, NewJob};
use super::store::{
    lease_deadline, EnqueueOutcome, JobStore, QueueDepths, ReclaimOutcome, ReclaimedJob,
    LEASE_EXPIRED_ERROR,
};
use crate::backend::RedisBackend;
use crate::error::{RelayError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Scripts
// ═══════════════════════════════════════════════════════════════════════════════

const PRELUDE: &str = r#"
local function holds_lease(key, owner, attempts)
  local f = redis.call('HMGET', key, 'status', 'lease_owner', 'attempts')
  return f[1] == 'processing' and f[2] == owner and f[3] == attempts
end

local function release_key(key, id, idem_prefix)
  local f = redis.call('HMGET', key, 'job_type', 'idempotency_key')
  local idem = idem_prefix .. string.len(f[1]) .. ':' .. f[1] .. ':' .. f[2]
  if redis.call('GET', idem) == id then
    redis.call('DEL', idem)
  end
end
"#;

// KEYS: idem, job, pending, types
// ARGV: id, job_type, idempotency_key, payload, max_attempts, now
const ENQUEUE: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
  return {existing, 0}
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2],
  'id', ARGV[1], 'job_type', ARGV[2], 'idempotency_key', ARGV[3],
  'payload', ARGV[4], 'status', 'pending', 'attempts', '0',
  'max_attempts', ARGV[5], 'progress', '0',
  'created_at', ARGV[6], 'updated_at', ARGV[6], 'run_at', ARGV[6])
redis.call('ZADD', KEYS[3], ARGV[6], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[2])
return {ARGV[1], 1}
"#;

// KEYS: pending, processing
// ARGV: now, lease_expires_at, owner, job_prefix
const LEASE: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 10)
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[4] .. id
  if redis.call('HGET', key, 'status') == 'pending' then
    redis.call('HSET', key, 'status', 'processing', 'lease_owner', ARGV[3],
      'lease_expires_at', ARGV[2], 'updated_at', ARGV[1])
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    return redis.call('HGETALL', key)
  end
end
return false
"#;

// KEYS: job, processing
// ARGV: id, owner, attempts, now, retention_secs, idem_prefix
const COMPLETE: &str = r#"
if not holds_lease(KEYS[1], ARGV[2], ARGV[3]) then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'completed', 'progress', '100',
  'finished_at', ARGV[4], 'updated_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'lease_owner', 'lease_expires_at')
redis.call('ZREM', KEYS[2], ARGV[1])
release_key(KEYS[1], ARGV[1], ARGV[6])
if tonumber(ARGV[5]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[5])
end
return 1
"#;

// KEYS: job, processing, pending
// ARGV: id, owner, attempts, now, run_at, error
const RETRY: &str = r#"
if not holds_lease(KEYS[1], ARGV[2], ARGV[3]) then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'pending',
  'attempts', tostring(tonumber(ARGV[3]) + 1), 'last_error', ARGV[6],
  'progress', '0', 'run_at', ARGV[5], 'updated_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'lease_owner', 'lease_expires_at')
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
return 1
"#;

// KEYS: job, processing
// ARGV: id, owner, attempts, now, error, idem_prefix
const FAIL: &str = r#"
if not holds_lease(KEYS[1], ARGV[2], ARGV[3]) then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'failed',
  'attempts', tostring(tonumber(ARGV[3]) + 1), 'last_error', ARGV[5],
  'finished_at', ARGV[4], 'updated_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'lease_owner', 'lease_expires_at')
redis.call('ZREM', KEYS[2], ARGV[1])
release_key(KEYS[1], ARGV[1], ARGV[6])
return 1
"#;

// KEYS: processing
// ARGV: now, limit, job_prefix, pending_prefix, idem_prefix, error
const RECLAIM: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local out = {}
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[3] .. id
  local f = redis.call('HMGET', key, 'status', 'lease_expires_at', 'max_attempts', 'job_type')
  if f[1] == 'processing' and tonumber(f[2] or '0') <= tonumber(ARGV[1]) then
    local attempts = redis.call('HINCRBY', key, 'attempts', 1)
    redis.call('HDEL', key, 'lease_owner', 'lease_expires_at')
    local outcome
    if attempts >= tonumber(f[3]) then
      redis.call('HSET', key, 'status', 'failed', 'last_error', ARGV[6],
        'finished_at', ARGV[1], 'updated_at', ARGV[1])
      release_key(key, id, ARGV[5])
      outcome = 'failed'
    else
      redis.call('HSET', key, 'status', 'pending', 'last_error', ARGV[6],
        'progress', '0', 'run_at', ARGV[1], 'updated_at', ARGV[1])
      redis.call('ZADD', ARGV[4] .. f[4], ARGV[1], id)
      outcome = 'requeued'
    end
    table.insert(out, id)
    table.insert(out, f[4])
    table.insert(out, tostring(attempts))
    table.insert(out, outcome)
  end
end
return out
"#;

// KEYS: job
// ARGV: percent
const PROGRESS: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'processing' then
  return 0
end
local current = tonumber(redis.call('HGET', KEYS[1], 'progress') or '0')
if tonumber(ARGV[1]) > current then
  redis.call('HSET', KEYS[1], 'progress', ARGV[1])
end
return 1
"#;

fn with_prelude(body: &str) -> Script {
    Script::new(&format!("{}{}", PRELUDE, body))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Record Decoding
// ═══════════════════════════════════════════════════════════════════════════════

struct FieldReader<'a> {
    key: &'a str,
    fields: &'a HashMap<String, String>,
}

impl<'a> FieldReader<'a> {
    fn text(&self, name: &str) -> Result<&'a str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RelayError::corrupt_record(self.key, format!("missing field '{}'", name)))
    }

    fn optional_text(&self, name: &str) -> Option<String> {
        self.fields.get(name).filter(|v| !v.is_empty()).cloned()
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<T> {
        self.text(name)?.parse::<T>().map_err(|_| {
            RelayError::corrupt_record(self.key, format!("field '{}' is not a number", name))
        })
    }

    fn time(&self, name: &str) -> Result<DateTime<Utc>> {
        let millis = self.parse::<i64>(name)?;
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            RelayError::corrupt_record(self.key, format!("field '{}' is out of range", name))
        })
    }

    fn optional_time(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.fields.get(name) {
            Some(v) if !v.is_empty() => self.time(name).map(Some),
            _ => Ok(None),
        }
    }
}

fn decode_job(key: &str, fields: &HashMap<String, String>) -> Result<Job> {
    let r = FieldReader { key, fields };
    Ok(Job {
        id: r.text("id")?.parse()?,
        job_type: r.text("job_type")?.to_string(),
        idempotency_key: r.text("idempotency_key")?.to_string(),
        payload: serde_json::from_str(r.text("payload")?)?,
        status: r.text("status")?.parse::<JobStatus>()?,
        attempts: r.parse("attempts")?,
        max_attempts: r.parse("max_attempts")?,
        progress: r.parse("progress")?,
        created_at: r.time("created_at")?,
        updated_at: r.time("updated_at")?,
        run_at: r.time("run_at")?,
        lease_expires_at: r.optional_time("lease_expires_at")?,
        lease_owner: r.optional_text("lease_owner"),
        last_error: r.optional_text("last_error"),
        finished_at: r.optional_time("finished_at")?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Job store shared by every worker instance pointed at the same Redis.
pub struct RedisJobStore {
    backend: Arc<RedisBackend>,
    completed_retention_secs: u64,
    enqueue_script: Script,
    lease_script: Script,
    complete_script: Script,
    retry_script: Script,
    fail_script: Script,
    reclaim_script: Script,
    progress_script: Script,
}

impl RedisJobStore {
    pub fn new(backend: Arc<RedisBackend>, completed_retention_secs: u64) -> Self {
        Self {
            backend,
            completed_retention_secs,
            enqueue_script: Script::new(ENQUEUE),
            lease_script: Script::new(LEASE),
            complete_script: with_prelude(COMPLETE),
            retry_script: with_prelude(RETRY),
            fail_script: with_prelude(FAIL),
            reclaim_script: with_prelude(RECLAIM),
            progress_script: Script::new(PROGRESS),
        }
    }

    fn job_key(&self, job_id: &JobId) -> String {
        self.backend.key(&["job", &job_id.to_string()])
    }

    /// The job type is length-prefixed so `:` inside either component cannot collide.
    fn idem_key(&self, job_type: &str, idempotency_key: &str) -> String {
        let type_len = job_type.len().to_string();
        self.backend.key(&["idem", &type_len, job_type, idempotency_key])
    }

    fn pending_key(&self, job_type: &str) -> String {
        self.backend.key(&["pending", job_type])
    }

    fn processing_key(&self) -> String {
        self.backend.key(&["processing"])
    }

    fn types_key(&self) -> String {
        self.backend.key(&["types"])
    }

    /// `{prefix}:{segment}:`, for keys the scripts derive from record fields.
    fn key_prefix(&self, segment: &str) -> String {
        self.backend.key(&[segment, ""])
    }

    fn guard(applied: i64, lease: &LeaseToken) -> Result<()> {
        if applied == 1 {
            Ok(())
        } else {
            Err(RelayError::lease_lost(lease.job_id, &lease.owner))
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let span = info_span!("redis_enqueue", job_type = %job.job_type, key = %job.idempotency_key);
        async {
            let mut conn = self.backend.connection().await?;
            let job_id = JobId::new();
            let payload = serde_json::to_string(&job.payload)?;

            let (id, created): (String, i64) = self
                .enqueue_script
                .key(self.idem_key(&job.job_type, &job.idempotency_key))
                .key(self.job_key(&job_id))
                .key(self.pending_key(&job.job_type))
                .key(self.types_key())
                .arg(job_id.to_string())
                .arg(&job.job_type)
                .arg(&job.idempotency_key)
                .arg(payload)
                .arg(job.max_attempts)
                .arg(now.timestamp_millis())
                .invoke_async(&mut conn)
                .await?;

            Ok(EnqueueOutcome {
                job_id: id.parse()?,
                created: created == 1,
            })
        }
        .instrument(span)
        .await
    }

    async fn lease(
        &self,
        job_type: &str,
        owner: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut conn = self.backend.connection().await?;
        let expires_at = lease_deadline(now, lease_duration)?;

        let fields: Option<HashMap<String, String>> = self
            .lease_script
            .key(self.pending_key(job_type))
            .key(self.processing_key())
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(owner)
            .arg(self.key_prefix("job"))
            .invoke_async(&mut conn)
            .await?;

        match fields {
            Some(fields) if !fields.is_empty() => {
                let job = decode_job(&self.pending_key(job_type), &fields)?;
                debug!(job_id = %job.id, job_type = %job_type, owner = %owner, "Leased job");
                Ok(Some(job))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, lease: &LeaseToken, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.backend.connection().await?;
        let applied: i64 = self
            .complete_script
            .key(self.job_key(&lease.job_id))
            .key(self.processing_key())
            .arg(lease.job_id.to_string())
            .arg(&lease.owner)
            .arg(lease.attempts)
            .arg(now.timestamp_millis())
            .arg(self.completed_retention_secs)
            .arg(self.key_prefix("idem"))
            .invoke_async(&mut conn)
            .await?;
        Self::guard(applied, lease)
    }

    async fn retry(
        &self,
        lease: &LeaseToken,
        error: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.backend.connection().await?;
        let applied: i64 = self
            .retry_script
            .key(self.job_key(&lease.job_id))
            .key(self.processing_key())
            .key(self.pending_key(&lease.job_type))
            .arg(lease.job_id.to_string())
            .arg(&lease.owner)
            .arg(lease.attempts)
            .arg(now.timestamp_millis())
            .arg(run_at.timestamp_millis())
            .arg(error)
            .invoke_async(&mut conn)
            .await?;
        Self::guard(applied, lease)
    }

    async fn fail(&self, lease: &LeaseToken, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.backend.connection().await?;
        let applied: i64 = self
            .fail_script
            .key(self.job_key(&lease.job_id))
            .key(self.processing_key())
            .arg(lease.job_id.to_string())
            .arg(&lease.owner)
            .arg(lease.attempts)
            .arg(now.timestamp_millis())
            .arg(error)
            .arg(self.key_prefix("idem"))
            .invoke_async(&mut conn)
            .await?;
        Self::guard(applied, lease)
    }

    async fn record_progress(&self, job_id: JobId, percent: u8) -> Result<()> {
        let mut conn = self.backend.connection().await?;
        let _: i64 = self
            .progress_script
            .key(self.job_key(&job_id))
            .arg(u32::from(percent.min(100)))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReclaimedJob>> {
        let mut conn = self.backend.connection().await?;
        let flat: Vec<String> = self
            .reclaim_script
            .key(self.processing_key())
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(self.key_prefix("job"))
            .arg(self.key_prefix("pending"))
            .arg(self.key_prefix("idem"))
            .arg(LEASE_EXPIRED_ERROR)
            .invoke_async(&mut conn)
            .await?;

        flat.chunks_exact(4)
            .map(|entry| -> Result<ReclaimedJob> {
                let outcome = match entry[3].as_str() {
                    "failed" => ReclaimOutcome::Failed,
                    _ => ReclaimOutcome::Requeued,
                };
                Ok(ReclaimedJob {
                    job_id: entry[0].parse()?,
                    job_type: entry[1].clone(),
                    attempts: entry[2].parse().map_err(|_| {
                        RelayError::corrupt_record(&entry[0], "attempts is not a number")
                    })?,
                    outcome,
                })
            })
            .collect()
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let mut conn = self.backend.connection().await?;
        let key = self.job_key(&job_id);
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(&key, &fields).map(Some)
    }

    async fn queue_depths(&self) -> Result<QueueDepths> {
        let mut conn = self.backend.connection().await?;
        let types: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.types_key())
            .query_async(&mut conn)
            .await?;

        let mut pipe = redis::pipe();
        for job_type in &types {
            pipe.cmd("ZCARD").arg(self.pending_key(job_type));
        }
        pipe.cmd("ZCARD").arg(self.processing_key());
        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;

        let processing = counts.last().copied().unwrap_or(0);
        let pending: BTreeMap<String, u64> = types.into_iter().zip(counts).collect();

        Ok(QueueDepths {
            pending,
            processing,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn record() -> HashMap<String, String> {
        let id = JobId::new().to_string();
        [
            ("id", id.as_str()),
            ("job_type", "fax"),
            ("idempotency_key", "fax-123"),
            ("payload", r#"{"pages":2}"#),
            ("status", "processing"),
            ("attempts", "1"),
            ("max_attempts", "3"),
            ("progress", "40"),
            ("created_at", "1700000000000"),
            ("updated_at", "1700000001000"),
            ("run_at", "1700000000000"),
            ("lease_expires_at", "1700000031000"),
            ("lease_owner", "worker-a"),
            ("last_error", "modem busy"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_decode_job() {
        let job = decode_job("relay:job:x", &record()).unwrap();
        assert_eq!(job.job_type, "fax");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.progress, 40);
        assert_eq!(job.payload["pages"], 2);
        assert_eq!(job.lease_owner.as_deref(), Some("worker-a"));
        assert_eq!(
            job.lease_expires_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_031_000)
        );
        assert!(job.finished_at.is_none());
        assert_eq!(job.lease().unwrap().attempts, 1);
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let mut fields = record();
        fields.remove("max_attempts");
        let error = decode_job("relay:job:x", &fields).unwrap_err();
        assert_eq!(error.code(), ErrorCode::CorruptRecord);
    }

    #[test]
    fn test_decode_rejects_bad_numbers() {
        let mut fields = record();
        fields.insert("attempts".to_string(), "many".to_string());
        assert!(decode_job("relay:job:x", &fields).is_err());
    }

    #[test]
    fn test_guard_scripts_share_prelude() {
        let store = RedisJobStore::new(
            Arc::new(RedisBackend::new(&crate::config::RedisConfig::default()).unwrap()),
            0,
        );
        assert_eq!(store.key_prefix("job"), "relay:job:");
        assert_eq!(store.idem_key("fax", "fax-123"), "relay:idem:3:fax:fax-123");
        assert_ne!(
            store.complete_script.get_hash(),
            Script::new(COMPLETE).get_hash()
        );
    }

    #[test]
    fn test_idem_key_separates_colons_in_components() {
        let store = RedisJobStore::new(
            Arc::new(RedisBackend::new(&crate::config::RedisConfig::default()).unwrap()),
            0,
        );
        assert_ne!(store.idem_key("a:b", "c"), store.idem_key("a", "b:c"));
        assert_eq!(store.idem_key("a:b", "c"), "relay:idem:3:a:b:c");
        assert!(PRELUDE.contains("string.len(f[1])"));
    }
}
