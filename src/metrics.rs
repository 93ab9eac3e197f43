//! Metrics Collector: thread-safe counters, per-stage duration stats, an
//! error-type histogram, and a bounded recent-activity log.
//!
//! Grounded in the teacher's `CostTracker` idiom: a single lock-guarded inner
//! struct holding plain aggregation fields, no lock-free atomics, snapshot by
//! cloning the inner struct out from under the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Maximum number of entries kept in the recent-activity log.
pub const ACTIVITY_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct StageStats {
    pub count: u64,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub total_duration: Duration,
    pub recent_errors: VecDeque<String>,
}

impl StageStats {
    fn new() -> Self {
        Self {
            count: 0,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            total_duration: Duration::ZERO,
            recent_errors: VecDeque::new(),
        }
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }

    fn record_duration(&mut self, d: Duration) {
        self.count += 1;
        self.min_duration = self.min_duration.min(d);
        self.max_duration = self.max_duration.max(d);
        self.total_duration += d;
    }

    fn record_error_message(&mut self, message: impl Into<String>) {
        const RECENT_ERRORS_CAP: usize = 20;
        if self.recent_errors.len() >= RECENT_ERRORS_CAP {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(message.into());
    }
}

#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub status: ActivityStatus,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Success,
    Error,
    Duration,
}

#[derive(Debug, Clone, Default)]
struct MetricsInner {
    total_processed: u64,
    success_count: u64,
    error_count: u64,
    stages: HashMap<String, StageStats>,
    error_histogram: HashMap<String, u64>,
    recent_activity: VecDeque<ActivityEntry>,
}

/// A deep-copied view returned by `Metrics::snapshot`, safe to inspect
/// without racing concurrent recorders.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub stages: HashMap<String, StageStats>,
    pub error_histogram: HashMap<String, u64>,
    pub recent_activity: VecDeque<ActivityEntry>,
}

impl MetricsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_processed as f64
        }
    }
}

/// Thread-safe metrics collector, one instance shared across a pipeline run
/// (or a process, at the implementer's discretion).
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    fn push_activity(inner: &mut MetricsInner, entry: ActivityEntry) {
        if inner.recent_activity.len() >= ACTIVITY_CAP {
            inner.recent_activity.pop_front();
        }
        inner.recent_activity.push_back(entry);
    }

    /// Record a stage's duration; independently of success/error recording,
    /// per the spec's accounting quirk this alone does not touch
    /// `total_processed`.
    pub fn record_duration(&self, stage: impl Into<String>, d: Duration) {
        let stage = stage.into();
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.stages.entry(stage.clone()).or_insert_with(StageStats::new).record_duration(d);
        Self::push_activity(
            &mut inner,
            ActivityEntry {
                timestamp: Utc::now(),
                stage,
                status: ActivityStatus::Duration,
                duration: Some(d),
                error: None,
            },
        );
    }

    pub fn record_success(&self, stage: impl Into<String>) {
        let stage = stage.into();
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.total_processed += 1;
        inner.success_count += 1;
        Self::push_activity(
            &mut inner,
            ActivityEntry {
                timestamp: Utc::now(),
                stage,
                status: ActivityStatus::Success,
                duration: None,
                error: None,
            },
        );
    }

    pub fn record_error(&self, stage: impl Into<String>, error: impl Into<String>) {
        let stage = stage.into();
        let error = error.into();
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.total_processed += 1;
        inner.error_count += 1;
        inner
            .stages
            .entry(stage.clone())
            .or_insert_with(StageStats::new)
            .record_error_message(error.clone());
        *inner.error_histogram.entry(error.clone()).or_insert(0) += 1;
        Self::push_activity(
            &mut inner,
            ActivityEntry {
                timestamp: Utc::now(),
                stage,
                status: ActivityStatus::Error,
                duration: None,
                error: Some(error),
            },
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            total_processed: inner.total_processed,
            success_count: inner.success_count,
            error_count: inner.error_count,
            stages: inner.stages.clone(),
            error_histogram: inner.error_histogram.clone(),
            recent_activity: inner.recent_activity.clone(),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        *inner = MetricsInner::default();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
