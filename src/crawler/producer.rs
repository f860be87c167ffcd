use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cli::config::ScraperConfig;
use crate::crawler::task::{Job, JobSpec};
use crate::storage::queue::{EnqueueOptions, JobRecord, QueueBackend, QueueCounts, QueueError};

/// Validates job specs and puts them on the queue
pub struct Producer {
    queue: Arc<dyn QueueBackend>,
    default_max_pages: u32,
    default_priority: i32,
}

impl Producer {
    pub fn new(queue: Arc<dyn QueueBackend>, config: &ScraperConfig) -> Self {
        Self {
            queue,
            default_max_pages: config.site.default_max_pages,
            default_priority: config.queue.default_priority,
        }
    }

    fn prepare(&self, spec: &JobSpec) -> Result<(Job, EnqueueOptions), QueueError> {
        let job = Job::from_spec(spec, self.default_max_pages).map_err(QueueError::InvalidJobSpec)?;
        let options = EnqueueOptions {
            priority: spec.priority.unwrap_or(self.default_priority),
            delay: Duration::from_millis(spec.delay_ms.unwrap_or(0)),
        };
        Ok((job, options))
    }

    /// Validate, fill in defaults and persist one job. Returns its id.
    pub async fn enqueue(&self, spec: &JobSpec) -> Result<String, QueueError> {
        let (job, options) = self.prepare(spec)?;
        let id = self.queue.enqueue(&job, options).await?;
        info!("Enqueued job {} for {}", id, job.label());
        Ok(id)
    }

    /// Every spec is validated before anything is written, so one bad
    /// entry rejects the whole batch.
    pub async fn enqueue_bulk(&self, specs: &[JobSpec]) -> Result<Vec<String>, QueueError> {
        let jobs = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                self.prepare(spec).map_err(|e| match e {
                    QueueError::InvalidJobSpec(message) => {
                        QueueError::InvalidJobSpec(format!("entry {}: {}", index + 1, message))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ids = self.queue.enqueue_bulk(&jobs).await?;
        info!("Enqueued {} job(s)", ids.len());
        Ok(ids)
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.queue.counts().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.queue.get(id).await
    }
}

/// Parse a bulk file: a JSON array of specs, or one keyword or URL per
/// line. Blank lines and lines starting with `#` are skipped.
pub fn parse_bulk_file(contents: &str) -> Result<Vec<JobSpec>, QueueError> {
    let trimmed = contents.trim_start();
    if trimmed.starts_with('[') {
        let specs: Vec<JobSpec> = serde_json::from_str(trimmed)?;
        return Ok(specs);
    }

    let specs: Vec<JobSpec> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            if line.starts_with("http://") || line.starts_with("https://") {
                JobSpec::url(line)
            } else {
                JobSpec::keyword(line)
            }
        })
        .collect();

    debug!("Parsed {} line(s) from bulk file", specs.len());
    Ok(specs)
}
