use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Worker job metrics collector
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Jobs that completed successfully
    pub jobs_completed: usize,

    /// Jobs that failed terminally
    pub jobs_failed: usize,

    /// Failed attempts that were rescheduled
    pub jobs_retried: usize,

    /// Failed attempts per error kind
    pub failures_by_kind: HashMap<String, usize>,

    /// Products extracted across all completed jobs
    pub products_extracted: usize,

    /// Finished attempts that were timed
    pub attempts_timed: u64,

    /// Summed wall-clock duration of those attempts, in milliseconds
    pub total_duration_ms: u64,

    /// Longest single attempt, in milliseconds
    pub max_duration_ms: u64,

    /// Peak number of jobs running at the same time
    pub peak_active_jobs: usize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            jobs_completed: 0,
            jobs_failed: 0,
            jobs_retried: 0,
            failures_by_kind: HashMap::new(),
            products_extracted: 0,
            attempts_timed: 0,
            total_duration_ms: 0,
            max_duration_ms: 0,
            peak_active_jobs: 0,
        }
    }
}

impl Metrics {
    /// Mean attempt duration in milliseconds
    pub fn average_duration_ms(&self) -> Option<u64> {
        if self.attempts_timed == 0 {
            return None;
        }
        Some(self.total_duration_ms / self.attempts_timed)
    }
}

/// Outcome of one finished job attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed { products: usize },
    Retried,
    Failed,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    /// Record a finished attempt. `error_kind` is set for failed attempts.
    pub async fn record_attempt(&self, outcome: AttemptOutcome, error_kind: Option<&str>, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;

        match outcome {
            AttemptOutcome::Completed { products } => {
                metrics.jobs_completed += 1;
                metrics.products_extracted += products;
            }
            AttemptOutcome::Retried => metrics.jobs_retried += 1,
            AttemptOutcome::Failed => metrics.jobs_failed += 1,
        }

        if let Some(kind) = error_kind {
            *metrics.failures_by_kind.entry(kind.to_string()).or_default() += 1;
        }

        metrics.attempts_timed += 1;
        metrics.total_duration_ms = metrics.total_duration_ms.saturating_add(duration_ms);
        metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
    }

    /// Track the number of concurrently running jobs
    pub async fn observe_active(&self, active: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.peak_active_jobs = metrics.peak_active_jobs.max(active);
    }

    /// Start timing a job attempt
    pub fn start_timer(&self) -> JobTimer {
        JobTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for measuring job attempt durations
pub struct JobTimer {
    /// Start time of the attempt
    start: Instant,
}

impl JobTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
