//! Point-in-time view of the queue, the limiters and recent job outcomes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::jobs::WorkerEvent;
use crate::limiter::LimiterMetrics;

/// Upper bound on outcomes held in the window, whatever its length.
const MAX_WINDOW_ENTRIES: usize = 100_000;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    /// False when the job store could not be read; depths are then empty
    pub store_available: bool,
    /// Pending jobs per type
    pub queue_depth: BTreeMap<String, u64>,
    pub processing: u64,
    pub limiters: BTreeMap<String, LimiterMetrics>,
    pub errors: ErrorStats,
}

impl MetricsSnapshot {
    /// Deepest queue, if any type has pending jobs.
    pub fn deepest_queue(&self) -> Option<(&str, u64)> {
        self.queue_depth
            .iter()
            .max_by_key(|(_, depth)| **depth)
            .map(|(job_type, depth)| (job_type.as_str(), *depth))
    }

    /// Service with the highest queued ratio among services that admitted anything.
    pub fn busiest_limiter(&self) -> Option<(&str, f64)> {
        self.limiters
            .iter()
            .filter(|(_, m)| m.total() > 0)
            .map(|(service, m)| (service.as_str(), m.queued_ratio()))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Outcome counts over the error window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub stalled: u64,
    /// `(retried + failed + stalled) / all`, 0 below the sample floor
    pub rate: f64,
}

impl ErrorStats {
    pub fn samples(&self) -> u64 {
        self.completed + self.retried + self.failed + self.stalled
    }

    pub fn errors(&self) -> u64 {
        self.retried + self.failed + self.stalled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Retried,
    Failed,
    Stalled,
}

/// Sliding window of job outcomes fed from worker events.
#[derive(Debug)]
pub struct ErrorWindow {
    window: Duration,
    min_samples: u64,
    outcomes: VecDeque<(DateTime<Utc>, Outcome)>,
}

impl ErrorWindow {
    pub fn new(window: Duration, min_samples: u64) -> Self {
        Self {
            window,
            min_samples,
            outcomes: VecDeque::new(),
        }
    }

    pub fn record(&mut self, event: &WorkerEvent) {
        let outcome = match event {
            WorkerEvent::Leased { .. } => return,
            WorkerEvent::Completed { .. } => Outcome::Completed,
            WorkerEvent::Retrying { .. } => Outcome::Retried,
            WorkerEvent::Failed { .. } => Outcome::Failed,
            WorkerEvent::Stalled { .. } => Outcome::Stalled,
        };
        if self.outcomes.len() >= MAX_WINDOW_ENTRIES {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((event.at(), outcome));
    }

    /// Drop outcomes older than the window and count the rest.
    pub fn stats(&mut self, now: DateTime<Utc>) -> ErrorStats {
        let horizon = chrono::Duration::from_std(self.window)
            .map(|window| now - window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        while matches!(self.outcomes.front(), Some((at, _)) if *at < horizon) {
            self.outcomes.pop_front();
        }

        let mut stats = ErrorStats::default();
        for (_, outcome) in &self.outcomes {
            match outcome {
                Outcome::Completed => stats.completed += 1,
                Outcome::Retried => stats.retried += 1,
                Outcome::Failed => stats.failed += 1,
                Outcome::Stalled => stats.stalled += 1,
            }
        }

        let samples = stats.samples();
        if samples > 0 && samples >= self.min_samples {
            stats.rate = stats.errors() as f64 / samples as f64;
        }
        stats
    }
}
