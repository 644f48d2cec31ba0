//! Worker lifecycle events, published on a bounded channel for the monitor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::job::JobId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Leased {
        job_id: JobId,
        job_type: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    Completed {
        job_id: JobId,
        job_type: String,
        attempts: u32,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    Retrying {
        job_id: JobId,
        job_type: String,
        attempts: u32,
        delay_ms: u64,
        error: String,
        at: DateTime<Utc>,
    },
    Failed {
        job_id: JobId,
        job_type: String,
        attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },
    /// A lease lapsed and the reaper took the job back
    Stalled {
        job_id: JobId,
        job_type: String,
        attempts: u32,
        requeued: bool,
        at: DateTime<Utc>,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Leased { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. } => *job_id,
        }
    }

    pub fn job_type(&self) -> &str {
        match self {
            Self::Leased { job_type, .. }
            | Self::Completed { job_type, .. }
            | Self::Retrying { job_type, .. }
            | Self::Failed { job_type, .. }
            | Self::Stalled { job_type, .. } => job_type,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Leased { at, .. }
            | Self::Completed { at, .. }
            | Self::Retrying { at, .. }
            | Self::Failed { at, .. }
            | Self::Stalled { at, .. } => *at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Leased { .. } => "leased",
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
        }
    }
}

/// Sending half used by the worker. Never blocks: a full channel drops the event.
#[derive(Clone, Default)]
pub struct EventPublisher {
    tx: Option<mpsc::Sender<WorkerEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn new(tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bounded channel pair.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn publish(&self, event: WorkerEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(error = %e, "Dropped worker event");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
