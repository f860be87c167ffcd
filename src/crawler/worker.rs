use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::browser::pool::{PoolError, PoolStatus, SessionPool};
use crate::cli::config::{ScraperConfig, WorkerSettings};
use crate::crawler::errors::{BackoffTable, ErrorClassifier, ErrorKind, RetryDecision};
use crate::crawler::scrape::Scraper;
use crate::crawler::task::{LastError, ScrapeResult};
use crate::storage::queue::{ClaimedJob, QueueBackend, QueueCounts, QueueError};
use crate::utils::metrics::{AttemptOutcome, MetricsCollector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Lifecycle notifications, at most one terminal event per attempt
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Claimed {
        job_id: String,
        attempt: u32,
    },
    Completed {
        job_id: String,
        total_products: usize,
        duration_ms: u64,
    },
    Retrying {
        job_id: String,
        attempt: u32,
        kind: ErrorKind,
        delay_ms: u64,
    },
    Failed {
        job_id: String,
        attempt: u32,
        kind: ErrorKind,
        reason: String,
    },
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub running: bool,
    pub active_jobs: usize,
    pub pool: PoolStatus,
}

/// How a shutdown went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Every job finished and the pool closed normally
    pub graceful: bool,
    /// Jobs still running when the deadline passed
    pub abandoned_jobs: usize,
    pub forced_kill: bool,
}

type StopFuture = Shared<BoxFuture<'static, StopReport>>;

struct WorkerInner {
    pool: Arc<SessionPool>,
    queue: Arc<dyn QueueBackend>,
    scraper: Arc<Scraper>,
    classifier: Arc<ErrorClassifier>,
    backoff: BackoffTable,
    metrics: MetricsCollector,
    settings: WorkerSettings,
    lease: Duration,
    pool_close_timeout: Duration,

    state: AtomicU8,
    started: AtomicBool,
    active_jobs: AtomicUsize,
    jobs_done: Notify,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: watch::Sender<bool>,
    loop_exited: watch::Sender<bool>,
    claim_loop: Mutex<Option<JoinHandle<()>>>,
    stopping: std::sync::Mutex<Option<StopFuture>>,
}

/// Counts a running job for as long as it lives
struct ActiveJob(Arc<WorkerInner>);

impl ActiveJob {
    fn enter(inner: Arc<WorkerInner>) -> Self {
        inner.active_jobs.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        if self.0.active_jobs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.jobs_done.notify_waiters();
        }
    }
}

/// Marks the claim loop as gone, even when it panics
struct LoopExit<'a>(&'a watch::Sender<bool>);

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl WorkerInner {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn emit(&self, event: WorkerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Sleep, returning early when shutdown is signalled
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn claim_loop(self: Arc<Self>) {
        let _exit = LoopExit(&self.loop_exited);
        let slots = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut shutdown = self.shutdown.subscribe();
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        let error_backoff = Duration::from_millis(self.settings.error_backoff_ms);

        info!("Claiming jobs with concurrency {}", self.settings.concurrency.max(1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.queue.claim(self.lease).await {
                Ok(Some(claim)) => {
                    let active = ActiveJob::enter(self.clone());
                    let inner = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _active = active;
                        inner.process(claim).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.pause(&mut shutdown, poll_interval).await;
                }
                Err(QueueError::Closed) => {
                    warn!("Queue closed; claim loop exiting");
                    break;
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to claim a job: {}", e);
                    self.pause(&mut shutdown, error_backoff).await;
                }
            }
        }

        debug!("Claim loop exited");
    }

    /// Keep the lease alive while the job runs
    fn heartbeat(&self, claim: &ClaimedJob) -> AbortOnDrop {
        let queue = self.queue.clone();
        let claim = claim.clone();
        let lease = self.lease;
        let period = (lease / 2).max(Duration::from_millis(100));

        AbortOnDrop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match queue.extend_lease(&claim, lease).await {
                    Ok(()) => debug!("Extended lease on job {}", claim.id),
                    Err(QueueError::LeaseLost(_)) => {
                        warn!("Lease on job {} was lost; another worker may pick it up", claim.id);
                        break;
                    }
                    Err(e) => warn!("Failed to extend lease on job {}: {}", claim.id, e),
                }
            }
        }))
    }

    async fn process(self: &Arc<Self>, claim: ClaimedJob) {
        info!("Claimed job {} ({}), attempt {}", claim.id, claim.job.label(), claim.attempt);
        self.emit(WorkerEvent::Claimed {
            job_id: claim.id.clone(),
            attempt: claim.attempt,
        });
        self.metrics.observe_active(self.active_jobs.load(Ordering::SeqCst)).await;

        let _heartbeat = self.heartbeat(&claim);
        let timer = self.metrics.start_timer();

        let scraper = self.scraper.clone();
        let job = claim.job.clone();
        let job_timeout = self.settings.job_timeout();
        let outcome = self
            .pool
            .acquire_and_run(move |session| async move { scraper.run(session.as_ref(), &job, job_timeout).await })
            .await;
        let duration_ms = timer.end();

        match outcome {
            Ok(result) => self.on_success(&claim, result, duration_ms).await,
            Err(error) if self.interrupted(&error) => {
                info!("Job {} interrupted by shutdown; returning it to the queue", claim.id);
                if let Err(e) = self.queue.release(&claim).await {
                    warn!("Failed to release job {}: {}", claim.id, e);
                }
            }
            Err(error) => self.on_failure(&claim, error, duration_ms).await,
        }
    }

    /// The attempt never really ran, or the pool was torn down under it
    fn interrupted(&self, error: &anyhow::Error) -> bool {
        let refused = matches!(
            error.downcast_ref::<PoolError>(),
            Some(PoolError::NotInitialized | PoolError::Draining | PoolError::Closed)
        );
        refused || (self.state() != WorkerState::Running && !self.pool.status().initialized)
    }

    async fn on_success(&self, claim: &ClaimedJob, result: ScrapeResult, duration_ms: u64) {
        let total_products = result.total_products;
        if let Err(e) = self.queue.complete(claim, &result).await {
            error!("Failed to mark job {} completed: {}", claim.id, e);
            return;
        }

        info!(
            "Job {} completed: {} products from {} page(s) in {} ms",
            claim.id, total_products, result.pages_scraped, duration_ms
        );
        self.metrics
            .record_attempt(AttemptOutcome::Completed { products: total_products }, None, duration_ms)
            .await;
        self.emit(WorkerEvent::Completed {
            job_id: claim.id.clone(),
            total_products,
            duration_ms,
        });
    }

    async fn on_failure(&self, claim: &ClaimedJob, error: anyhow::Error, duration_ms: u64) {
        let kind = self.classifier.classify(&error);
        let message = format!("{:#}", error);
        let previous = claim.job.last_error.as_ref().map(|e| e.kind);

        let last_error = LastError {
            kind,
            message: message.clone(),
            attempt: claim.attempt,
            timestamp: Utc::now(),
        };

        match kind {
            ErrorKind::ContentSelectorMissing => error!(
                "Job {} found no content (attempt {}); the page structure may have changed: {}",
                claim.id, claim.attempt, message
            ),
            ErrorKind::Unknown if previous == Some(ErrorKind::Unknown) => error!(
                "Job {} failed again with an unclassified error (attempt {}): {}",
                claim.id, claim.attempt, message
            ),
            _ => warn!("Job {} attempt {} failed ({}): {}", claim.id, claim.attempt, kind, message),
        }

        match self.backoff.decide(kind, claim.attempt) {
            RetryDecision::Retry { delay } => {
                if let Err(e) = self.queue.retry(claim, &last_error, delay).await {
                    error!("Failed to reschedule job {}: {}", claim.id, e);
                    return;
                }
                info!("Job {} rescheduled in {} ms", claim.id, delay.as_millis());
                self.metrics
                    .record_attempt(AttemptOutcome::Retried, Some(kind.as_str()), duration_ms)
                    .await;
                self.emit(WorkerEvent::Retrying {
                    job_id: claim.id.clone(),
                    attempt: claim.attempt,
                    kind,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            RetryDecision::Fail { reason } => {
                if let Err(e) = self.queue.fail(claim, &last_error, &reason).await {
                    error!("Failed to mark job {} failed: {}", claim.id, e);
                    return;
                }
                error!("Job {} failed permanently: {}", claim.id, reason);
                self.metrics
                    .record_attempt(AttemptOutcome::Failed, Some(kind.as_str()), duration_ms)
                    .await;
                self.emit(WorkerEvent::Failed {
                    job_id: claim.id.clone(),
                    attempt: claim.attempt,
                    kind,
                    reason,
                });
            }
        }
    }

    async fn wait_for_jobs(&self) {
        loop {
            let notified = self.jobs_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_jobs.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn shutdown(self: Arc<Self>, timeout: Duration) -> StopReport {
        self.set_state(WorkerState::Stopping);
        info!("Stopping worker ({} active jobs)", self.active_jobs.load(Ordering::SeqCst));
        self.emit(WorkerEvent::Stopping);
        self.shutdown.send_replace(true);

        let deadline = Instant::now() + timeout;
        let mut exited = self.loop_exited.subscribe();
        let loop_done = tokio::time::timeout_at(deadline, exited.wait_for(|done| *done)).await.is_ok();
        if !loop_done {
            warn!("Claim loop did not exit before the deadline");
        }

        let drained = tokio::time::timeout_at(deadline, self.wait_for_jobs()).await.is_ok();
        let abandoned_jobs = if drained {
            0
        } else {
            let still_running = self.active_jobs.load(Ordering::SeqCst);
            warn!(
                "{} job(s) still running after {} ms; abandoning them",
                still_running,
                timeout.as_millis()
            );
            still_running
        };

        let close_timeout = if drained { self.pool_close_timeout } else { Duration::ZERO };
        let mut forced_kill = false;
        if let Err(e) = self.pool.close(close_timeout).await {
            warn!("Session pool did not close cleanly: {:#}", e);
            self.pool.force_kill().await;
            forced_kill = true;
        }

        if let Err(e) = self.queue.close().await {
            warn!("Failed to close queue: {}", e);
        }

        let metrics = self.metrics.get_metrics().await;
        info!(
            "Worker summary: {} completed, {} retried, {} failed, {} products, average attempt {} ms",
            metrics.jobs_completed,
            metrics.jobs_retried,
            metrics.jobs_failed,
            metrics.products_extracted,
            metrics.average_duration_ms().unwrap_or(0)
        );

        self.set_state(WorkerState::Stopped);
        self.emit(WorkerEvent::Stopped);
        info!("Worker stopped");

        StopReport {
            graceful: drained && !forced_kill,
            abandoned_jobs,
            forced_kill,
        }
    }
}

/// Claims jobs from the queue and runs them through the session pool.
///
/// A worker is started once; after `stop` it stays stopped.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(
        config: &ScraperConfig,
        pool: Arc<SessionPool>,
        queue: Arc<dyn QueueBackend>,
        scraper: Arc<Scraper>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        // No claim loop yet counts as an exited one
        let (loop_exited, _) = watch::channel(true);

        Self {
            inner: Arc::new(WorkerInner {
                pool,
                queue,
                scraper,
                classifier,
                backoff: BackoffTable::new(config.retry.clone()),
                metrics: MetricsCollector::new(),
                settings: config.worker.clone(),
                lease: config.queue.lease(),
                pool_close_timeout: config.pool.close_timeout(),
                state: AtomicU8::new(WorkerState::Stopped as u8),
                started: AtomicBool::new(false),
                active_jobs: AtomicUsize::new(0),
                jobs_done: Notify::new(),
                events,
                shutdown,
                loop_exited,
                claim_loop: Mutex::new(None),
                stopping: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Initialize the pool and begin claiming jobs
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Worker has already been started");
        }

        self.inner.set_state(WorkerState::Starting);
        info!("Starting worker");

        if let Err(e) = self.inner.pool.init().await {
            self.inner.set_state(WorkerState::Stopped);
            return Err(e.context("Worker failed to start"));
        }

        self.inner.loop_exited.send_replace(false);
        self.inner.set_state(WorkerState::Running);
        let handle = tokio::spawn(self.inner.clone().claim_loop());
        *self.inner.claim_loop.lock().await = Some(handle);

        info!("Worker running");
        Ok(())
    }

    /// Stop claiming, wait up to `timeout` for running jobs, then release
    /// the pool and the queue. Concurrent and repeated calls share one
    /// shutdown and all resolve when it completes.
    pub async fn stop(&self, timeout: Duration) -> StopReport {
        let shutdown = {
            let mut stopping = match self.inner.stopping.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            stopping
                .get_or_insert_with(|| self.inner.clone().shutdown(timeout).boxed().shared())
                .clone()
        };
        shutdown.await
    }

    /// Resolves when the claim loop ends. An error means it crashed.
    pub async fn join(&self) -> Result<()> {
        let handle = self.inner.claim_loop.lock().await.take();
        if let Some(handle) = handle {
            handle.await.context("Claim loop crashed")?;
        }
        Ok(())
    }

    pub fn status(&self) -> WorkerStatus {
        let state = self.inner.state();
        WorkerStatus {
            state,
            running: state == WorkerState::Running,
            active_jobs: self.inner.active_jobs.load(Ordering::SeqCst),
            pool: self.inner.pool.status(),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.inner.metrics.clone()
    }
}

/// Bring the pool up, run one trivial pooled task, read the queue counts
/// and shut everything down again
pub async fn dry_run(
    pool: Arc<SessionPool>,
    queue: Arc<dyn QueueBackend>,
    close_timeout: Duration,
) -> Result<QueueCounts> {
    pool.init().await.context("Dry run: session pool failed to start")?;

    let checked = pool
        .acquire_and_run(|session| async move {
            session.navigate("about:blank").await?;
            Ok::<_, anyhow::Error>(session.id())
        })
        .await;

    let counts = match checked {
        Ok(session_id) => {
            info!("Dry run: session {} navigated successfully", session_id);
            queue.counts().await.context("Dry run: failed to read queue counts")
        }
        Err(e) => Err(e.context("Dry run: pooled task failed")),
    };

    if let Err(e) = pool.close(close_timeout).await {
        warn!("Dry run: pool did not close cleanly: {:#}", e);
        pool.force_kill().await;
    }
    if let Err(e) = queue.close().await {
        warn!("Dry run: failed to close queue: {}", e);
    }

    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::stub::{StubListing, StubProvider, StubSite};
    use crate::cli::config::ScrollBehavior;
    use crate::crawler::extract::SelectorExtractor;
    use crate::crawler::producer::Producer;
    use crate::crawler::task::JobSpec;
    use crate::storage::memory_queue::MemoryQueue;

    struct Harness {
        worker: Worker,
        producer: Producer,
        provider: Arc<StubProvider>,
    }

    fn harness(site: StubSite, adjust: impl FnOnce(&mut ScraperConfig)) -> Harness {
        let mut config = ScraperConfig::default();
        config.loading.scroll = ScrollBehavior {
            reading_pause_chance: 0.0,
            reverse_scroll_chance: 0.0,
            ..ScrollBehavior::default()
        };
        config.worker.poll_interval_ms = 50;
        adjust(&mut config);

        let provider = Arc::new(StubProvider::new(site));
        let pool = Arc::new(SessionPool::new(provider.clone(), config.pool.capacity));
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(&config.queue));
        let extractor = Arc::new(SelectorExtractor::new(&config.extraction).unwrap());
        let classifier = Arc::new(ErrorClassifier::new().unwrap());
        let scraper = Arc::new(Scraper::new(&config, extractor, classifier.clone()).unwrap());

        Harness {
            worker: Worker::new(&config, pool, queue.clone(), scraper, classifier),
            producer: Producer::new(queue, &config),
            provider,
        }
    }

    async fn next_event<F>(events: &mut broadcast::Receiver<WorkerEvent>, wanted: F) -> WorkerEvent
    where
        F: Fn(&WorkerEvent) -> bool,
    {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    }

    fn is_terminal(event: &WorkerEvent) -> bool {
        matches!(event, WorkerEvent::Completed { .. } | WorkerEvent::Failed { .. })
    }

    fn drain(events: &mut broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_job_completes_with_products() {
        let h = harness(StubSite::new(vec![StubListing::growing(0, 10, 3)]), |_| {});
        let mut events = h.worker.events();
        h.worker.start().await.unwrap();
        assert!(h.worker.status().running);

        let id = h
            .producer
            .enqueue(&JobSpec::keyword("iphone 15").with_max_pages(2))
            .await
            .unwrap();

        match next_event(&mut events, is_terminal).await {
            WorkerEvent::Completed { job_id, total_products, .. } => {
                assert_eq!(job_id, id);
                assert_eq!(total_products, 30);
            }
            other => panic!("expected completion, got {:?}", other),
        }

        let record = h.producer.get(&id).await.unwrap().unwrap();
        let result = record.result.unwrap();
        assert!(result.success);
        assert_eq!(result.total_products, 30);

        let report = h.worker.stop(Duration::from_secs(30)).await;
        assert!(report.graceful);
        assert!(h.provider.was_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_job_fails_after_two_attempts() {
        let site = StubSite::new(vec![StubListing::flat("Access Denied", 0)]);
        let h = harness(site, |config| config.retry.max_attempts = 5);
        let mut events = h.worker.events();
        h.worker.start().await.unwrap();

        let id = h.producer.enqueue(&JobSpec::keyword("tv")).await.unwrap();

        match next_event(&mut events, |e| matches!(e, WorkerEvent::Retrying { .. })).await {
            WorkerEvent::Retrying { attempt, kind, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(kind, ErrorKind::BlockedOrBanned);
            }
            other => panic!("expected retry, got {:?}", other),
        }
        match next_event(&mut events, is_terminal).await {
            WorkerEvent::Failed { attempt, kind, .. } => {
                assert_eq!(attempt, 2);
                assert_eq!(kind, ErrorKind::BlockedOrBanned);
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let record = h.producer.get(&id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        let last_error = record.job.last_error.unwrap();
        assert_eq!(last_error.kind, ErrorKind::BlockedOrBanned);
        assert_eq!(last_error.attempt, 2);

        h.worker.stop(Duration::from_secs(30)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_is_retried_then_completes() {
        let site = StubSite::new(vec![StubListing::flat("Search results", 4)]);
        site.fail_navigations(&["unknown error: net::ERR_CONNECTION_RESET"; 3]);
        let h = harness(site, |_| {});
        let mut events = h.worker.events();
        h.worker.start().await.unwrap();

        h.producer.enqueue(&JobSpec::keyword("tv")).await.unwrap();

        match next_event(&mut events, |e| !matches!(e, WorkerEvent::Claimed { .. })).await {
            WorkerEvent::Retrying { kind, .. } => assert_eq!(kind, ErrorKind::NetworkFailure),
            other => panic!("expected retry, got {:?}", other),
        }
        match next_event(&mut events, is_terminal).await {
            WorkerEvent::Completed { total_products, .. } => assert_eq!(total_products, 4),
            other => panic!("expected completion, got {:?}", other),
        }

        let metrics = h.worker.metrics().get_metrics().await;
        assert_eq!(metrics.jobs_retried, 1);
        assert_eq!(metrics.jobs_completed, 1);

        h.worker.stop(Duration::from_secs(30)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stops_share_one_shutdown() {
        let h = harness(StubSite::new(vec![StubListing::flat("Search results", 1)]), |_| {});
        let mut events = h.worker.events();
        h.worker.start().await.unwrap();

        let timeout = Duration::from_secs(5);
        let (first, second) = tokio::join!(h.worker.stop(timeout), h.worker.stop(timeout));
        assert_eq!(first, second);
        assert!(first.graceful);

        let seen = drain(&mut events);
        let stopping = seen.iter().filter(|e| **e == WorkerEvent::Stopping).count();
        let stopped = seen.iter().filter(|e| **e == WorkerEvent::Stopped).count();
        assert_eq!((stopping, stopped), (1, 1));
        assert_eq!(h.worker.status().state, WorkerState::Stopped);

        // stopping again is a no-op returning the same report
        assert_eq!(h.worker.stop(timeout).await, first);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_jobs() {
        let h = harness(StubSite::new(vec![StubListing::growing(0, 10, 3)]), |_| {});
        let mut events = h.worker.events();
        h.worker.start().await.unwrap();

        h.producer.enqueue(&JobSpec::keyword("tv")).await.unwrap();
        next_event(&mut events, |e| matches!(e, WorkerEvent::Claimed { .. })).await;

        let report = h.worker.stop(Duration::from_secs(300)).await;
        assert!(report.graceful);
        assert_eq!(report.abandoned_jobs, 0);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, WorkerEvent::Completed { total_products: 30, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_past_deadline_force_kills_the_pool() {
        let h = harness(StubSite::new(vec![StubListing::growing(0, 10, 50)]), |_| {});
        let mut events = h.worker.events();
        h.worker.start().await.unwrap();

        h.producer.enqueue(&JobSpec::keyword("tv")).await.unwrap();
        next_event(&mut events, |e| matches!(e, WorkerEvent::Claimed { .. })).await;

        let report = h.worker.stop(Duration::from_secs(1)).await;
        assert!(!report.graceful);
        assert!(report.forced_kill);
        assert_eq!(report.abandoned_jobs, 1);
        assert!(h.provider.was_killed());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_cannot_be_started_twice() {
        let h = harness(StubSite::new(vec![StubListing::flat("Search results", 1)]), |_| {});
        h.worker.start().await.unwrap();
        assert!(h.worker.start().await.is_err());
        h.worker.stop(Duration::from_secs(5)).await;
        assert!(h.worker.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pool_start_leaves_worker_stopped() {
        let provider = Arc::new(StubProvider::failing_start(StubSite::new(Vec::new())));
        let config = ScraperConfig::default();
        let pool = Arc::new(SessionPool::new(provider, 1));
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(&config.queue));
        let extractor = Arc::new(SelectorExtractor::new(&config.extraction).unwrap());
        let classifier = Arc::new(ErrorClassifier::new().unwrap());
        let scraper = Arc::new(Scraper::new(&config, extractor, classifier.clone()).unwrap());
        let worker = Worker::new(&config, pool, queue, scraper, classifier);

        assert!(worker.start().await.is_err());
        assert_eq!(worker.status().state, WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_checks_pool_and_queue() {
        let provider = Arc::new(StubProvider::new(StubSite::new(vec![StubListing::flat("Blank", 0)])));
        let pool = Arc::new(SessionPool::new(provider.clone(), 1));
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(&Default::default()));

        let counts = dry_run(pool.clone(), queue, Duration::from_secs(5)).await.unwrap();

        assert_eq!(counts, QueueCounts::default());
        assert_eq!(provider.sessions_created(), 1);
        assert!(provider.was_shut_down());
        assert!(!pool.status().initialized);
    }
}
