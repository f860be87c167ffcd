use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::cli::config::QueueSettings;
use crate::crawler::task::{Job, LastError, ScrapeResult};
use crate::storage::memory_queue::MemoryQueue;
use crate::storage::redis_queue::RedisQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    /// The lease expired and the job was handed to someone else
    #[error("lease lost for job {0}")]
    LeaseLost(String),

    #[error("queue is closed")]
    Closed,
}

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling options for a new job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Lower is claimed first
    pub priority: i32,
    pub delay: Duration,
}

/// Everything the queue knows about a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub job: Job,
    /// Attempts started so far
    pub attempts: u32,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<ScrapeResult>,
    pub failure: Option<String>,
}

/// A job leased to one worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    /// Must accompany every transition of this claim
    pub token: String,
    pub job: Job,
    /// 1-based number of this attempt
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Durable priority queue with leased claims
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue(&self, job: &Job, options: EnqueueOptions) -> Result<String, QueueError>;

    /// All jobs are persisted or none are
    async fn enqueue_bulk(&self, jobs: &[(Job, EnqueueOptions)]) -> Result<Vec<String>, QueueError>;

    /// Lease the next eligible job: lowest priority value first, then
    /// oldest. Due delayed jobs and jobs with expired leases are eligible.
    async fn claim(&self, lease: Duration) -> Result<Option<ClaimedJob>, QueueError>;

    async fn extend_lease(&self, claim: &ClaimedJob, lease: Duration) -> Result<(), QueueError>;

    async fn complete(&self, claim: &ClaimedJob, result: &ScrapeResult) -> Result<(), QueueError>;

    /// Record the failure and make the job eligible again after `delay`
    async fn retry(&self, claim: &ClaimedJob, error: &LastError, delay: Duration) -> Result<(), QueueError>;

    /// Record the failure and finalize the job
    async fn fail(&self, claim: &ClaimedJob, error: &LastError, reason: &str) -> Result<(), QueueError>;

    /// Give the job back untouched; the attempt does not count
    async fn release(&self, claim: &ClaimedJob) -> Result<(), QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Open the backend named in the settings
pub async fn connect(settings: &QueueSettings) -> Result<Arc<dyn QueueBackend>> {
    match settings.backend.as_str() {
        "redis" => {
            let queue = RedisQueue::connect(settings).await?;
            info!("Connected to Redis queue at {}", settings.redis_url);
            Ok(Arc::new(queue))
        }
        "memory" => {
            info!("Using in-memory queue");
            Ok(Arc::new(MemoryQueue::new(settings)))
        }
        other => anyhow::bail!("Unknown queue backend: {}", other),
    }
}
