use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cli::config::{QueueSettings, RetentionSettings};
use crate::crawler::task::{Job, LastError, ScrapeResult};
use crate::storage::queue::{
    ClaimedJob, EnqueueOptions, JobRecord, JobState, QueueBackend, QueueCounts, QueueError,
};

struct Entry {
    record: JobRecord,
    /// Tie-breaker within a priority; lower was queued earlier
    seq: u64,
    available: Instant,
    lease_until: Option<Instant>,
    token: Option<String>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    seq: u64,
    closed: bool,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn open(&mut self) -> Result<&mut Self, QueueError> {
        if self.closed {
            return Err(QueueError::Closed);
        }
        Ok(self)
    }

    fn leased(&mut self, claim: &ClaimedJob) -> Result<&mut Entry, QueueError> {
        match self.entries.get_mut(&claim.id) {
            Some(entry)
                if entry.record.state == JobState::Active
                    && entry.token.as_deref() == Some(claim.token.as_str()) =>
            {
                Ok(entry)
            }
            Some(_) => Err(QueueError::LeaseLost(claim.id.clone())),
            None => Err(QueueError::NotFound(claim.id.clone())),
        }
    }

    /// Move due delayed jobs and expired leases back to waiting
    fn promote(&mut self, now: Instant) {
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| match e.record.state {
                JobState::Delayed => e.available <= now,
                JobState::Active => e.lease_until.map(|t| t <= now).unwrap_or(false),
                _ => false,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let seq = self.next_seq();
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.record.state == JobState::Active {
                    warn!("Lease on job {} expired; returning it to the queue", id);
                }
                entry.record.state = JobState::Waiting;
                entry.lease_until = None;
                entry.token = None;
                entry.seq = seq;
            }
        }
    }

    fn prune(&mut self, state: JobState, retention: &RetentionSettings) {
        let now = Utc::now();
        let max_age = chrono::Duration::seconds(retention.max_age_secs as i64);

        let mut finished: Vec<(String, chrono::DateTime<Utc>)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.record.state == state)
            .map(|(id, e)| (id.clone(), e.record.finished_at.unwrap_or(now)))
            .collect();
        finished.sort_by_key(|(_, at)| *at);

        let excess = finished.len().saturating_sub(retention.max_count);
        for (index, (id, at)) in finished.into_iter().enumerate() {
            if index < excess || now - at > max_age {
                self.entries.remove(&id);
            }
        }
    }
}

/// Single-process queue with the same semantics as the Redis backend
pub struct MemoryQueue {
    state: Mutex<State>,
    completed_retention: RetentionSettings,
    failed_retention: RetentionSettings,
}

impl MemoryQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            state: Mutex::new(State::default()),
            completed_retention: settings.completed_retention.clone(),
            failed_retention: settings.failed_retention.clone(),
        }
    }

    fn insert(state: &mut State, job: &Job, options: EnqueueOptions) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let delayed = !options.delay.is_zero();
        let seq = state.next_seq();

        let record = JobRecord {
            id: id.clone(),
            state: if delayed { JobState::Delayed } else { JobState::Waiting },
            job: job.clone(),
            attempts: 0,
            priority: options.priority,
            enqueued_at: now,
            available_at: now + chrono::Duration::from_std(options.delay).unwrap_or_else(|_| chrono::Duration::zero()),
            finished_at: None,
            result: None,
            failure: None,
        };

        state.entries.insert(
            id.clone(),
            Entry {
                record,
                seq,
                available: Instant::now() + options.delay,
                lease_until: None,
                token: None,
            },
        );
        id
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, job: &Job, options: EnqueueOptions) -> Result<String, QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        let id = Self::insert(state, job, options);
        debug!("Enqueued job {}", id);
        Ok(id)
    }

    async fn enqueue_bulk(&self, jobs: &[(Job, EnqueueOptions)]) -> Result<Vec<String>, QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        Ok(jobs
            .iter()
            .map(|(job, options)| Self::insert(state, job, *options))
            .collect())
    }

    async fn claim(&self, lease: Duration) -> Result<Option<ClaimedJob>, QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        let now = Instant::now();
        state.promote(now);

        let next = state
            .entries
            .iter()
            .filter(|(_, e)| e.record.state == JobState::Waiting)
            .min_by_key(|(_, e)| (e.record.priority, e.seq))
            .map(|(id, _)| id.clone());
        let Some(id) = next else {
            return Ok(None);
        };

        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(None);
        };
        let token = Uuid::new_v4().to_string();
        entry.record.state = JobState::Active;
        entry.record.attempts += 1;
        entry.lease_until = Some(now + lease);
        entry.token = Some(token.clone());

        Ok(Some(ClaimedJob {
            id,
            token,
            job: entry.record.job.clone(),
            attempt: entry.record.attempts,
        }))
    }

    async fn extend_lease(&self, claim: &ClaimedJob, lease: Duration) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let entry = guard.open()?.leased(claim)?;
        entry.lease_until = Some(Instant::now() + lease);
        Ok(())
    }

    async fn complete(&self, claim: &ClaimedJob, result: &ScrapeResult) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        let entry = state.leased(claim)?;
        entry.record.state = JobState::Completed;
        entry.record.result = Some(result.clone());
        entry.record.finished_at = Some(Utc::now());
        entry.lease_until = None;
        entry.token = None;
        state.prune(JobState::Completed, &self.completed_retention);
        Ok(())
    }

    async fn retry(&self, claim: &ClaimedJob, error: &LastError, delay: Duration) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        let seq = state.next_seq();
        let entry = state.leased(claim)?;
        entry.record.job.last_error = Some(error.clone());
        entry.record.state = if delay.is_zero() { JobState::Waiting } else { JobState::Delayed };
        entry.record.available_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        entry.available = Instant::now() + delay;
        entry.lease_until = None;
        entry.token = None;
        entry.seq = seq;
        Ok(())
    }

    async fn fail(&self, claim: &ClaimedJob, error: &LastError, reason: &str) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        let entry = state.leased(claim)?;
        entry.record.job.last_error = Some(error.clone());
        entry.record.state = JobState::Failed;
        entry.record.failure = Some(reason.to_string());
        entry.record.finished_at = Some(Utc::now());
        entry.lease_until = None;
        entry.token = None;
        state.prune(JobState::Failed, &self.failed_retention);
        Ok(())
    }

    async fn release(&self, claim: &ClaimedJob) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let entry = guard.open()?.leased(claim)?;
        entry.record.state = JobState::Waiting;
        entry.record.attempts = entry.record.attempts.saturating_sub(1);
        entry.lease_until = None;
        entry.token = None;
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        let mut counts = QueueCounts::default();
        for entry in state.entries.values() {
            match entry.record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        let mut guard = self.state.lock().await;
        let state = guard.open()?;
        Ok(state.entries.get(id).map(|e| e.record.clone()))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}
