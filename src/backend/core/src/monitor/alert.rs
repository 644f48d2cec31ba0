//! Threshold rules with cooldown, and the capped alert log they write to.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use super::snapshot::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fired alert, as read by dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// What a condition saw when it held.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
}

impl Breach {
    pub fn new(message: impl Into<String>, current_value: f64, threshold: f64) -> Self {
        Self {
            message: message.into(),
            current_value,
            threshold,
        }
    }
}

/// Returns `Some` when the rule's condition holds for the snapshot.
pub type AlertCondition = Box<dyn Fn(&MetricsSnapshot) -> Option<Breach> + Send + Sync>;

/// A named condition that fires at most once per cooldown.
pub struct AlertRule {
    name: String,
    severity: AlertSeverity,
    cooldown: Duration,
    condition: AlertCondition,
    last_triggered_at: Option<DateTime<Utc>>,
}

impl AlertRule {
    pub fn new<F>(name: impl Into<String>, severity: AlertSeverity, cooldown: Duration, condition: F) -> Self
    where
        F: Fn(&MetricsSnapshot) -> Option<Breach> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            severity,
            cooldown,
            condition: Box::new(condition),
            last_triggered_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn severity(&self) -> AlertSeverity {
        self.severity
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn last_triggered_at(&self) -> Option<DateTime<Utc>> {
        self.last_triggered_at
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        match (self.last_triggered_at, chrono::Duration::from_std(self.cooldown)) {
            (Some(last), Ok(cooldown)) => now < last + cooldown,
            (Some(_), Err(_)) => true,
            (None, _) => false,
        }
    }

    /// Fire if the condition holds and the cooldown has elapsed.
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> Option<Alert> {
        if self.is_cooling_down(now) {
            return None;
        }
        let breach = (self.condition)(snapshot)?;
        self.last_triggered_at = Some(now);

        Some(Alert {
            name: self.name.clone(),
            severity: self.severity,
            message: breach.message,
            current_value: breach.current_value,
            threshold: breach.threshold,
            timestamp: now,
        })
    }
}

impl fmt::Debug for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .field("cooldown", &self.cooldown)
            .field("last_triggered_at", &self.last_triggered_at)
            .finish()
    }
}

/// Append-only alert list; the oldest entries drop once `capacity` is reached.
#[derive(Debug)]
pub struct AlertLog {
    entries: RwLock<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<Alert> {
        self.entries.read().iter().cloned().collect()
    }

    /// Remove every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
