use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::browser::driver::WebDriverProvider;
use crate::browser::pool::SessionPool;
use crate::cli::config::ScraperConfig;
use crate::crawler::errors::ErrorClassifier;
use crate::crawler::extract::SelectorExtractor;
use crate::crawler::producer::{parse_bulk_file, Producer};
use crate::crawler::scrape::Scraper;
use crate::crawler::task::JobSpec;
use crate::crawler::worker::{StopReport, Worker};
use crate::storage::queue::{self, QueueBackend};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

async fn open_queue(config: &ScraperConfig) -> Result<Arc<dyn QueueBackend>> {
    if config.queue.backend == "memory" {
        warn!("The memory queue does not outlive this process");
    }
    queue::connect(&config.queue).await
}

fn build_pool(config: &ScraperConfig) -> Result<Arc<SessionPool>> {
    let longest_observe = Duration::from_millis(
        config
            .loading
            .escalated_observe_timeout_ms
            .max(config.loading.observe_timeout_ms),
    );
    let provider = Arc::new(WebDriverProvider::new(config.browser.clone(), longest_observe)?);
    Ok(Arc::new(SessionPool::new(provider, config.pool.capacity)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

/// Add one job
pub async fn enqueue(config: ScraperConfig, spec: JobSpec) -> Result<()> {
    let queue = open_queue(&config).await?;
    let producer = Producer::new(queue.clone(), &config);

    let id = producer.enqueue(&spec).await?;
    println!("Enqueued job {}", id);

    queue.close().await?;
    Ok(())
}

/// Add every job listed in `file` as one batch
pub async fn enqueue_bulk(
    config: ScraperConfig,
    file: PathBuf,
    max_pages: Option<u32>,
    priority: Option<i32>,
) -> Result<()> {
    let contents = tokio::fs::read_to_string(&file)
        .await
        .context(format!("Failed to read {}", file.display()))?;

    let mut specs = parse_bulk_file(&contents).context(format!("Failed to parse {}", file.display()))?;
    if specs.is_empty() {
        warn!("{} contains no jobs", file.display());
        return Ok(());
    }
    for spec in &mut specs {
        spec.max_pages = spec.max_pages.or(max_pages);
        spec.priority = spec.priority.or(priority);
    }

    let queue = open_queue(&config).await?;
    let producer = Producer::new(queue.clone(), &config);
    let ids = producer.enqueue_bulk(&specs).await?;
    println!("Enqueued {} job(s)", ids.len());
    for id in ids {
        println!("  - {}", id);
    }

    queue.close().await?;
    Ok(())
}

fn log_report(report: &StopReport) {
    if report.graceful {
        info!("Worker shut down gracefully");
    } else {
        warn!(
            "Worker shut down with {} abandoned job(s){}",
            report.abandoned_jobs,
            if report.forced_kill { " after force-killing the browser" } else { "" }
        );
    }
}

/// Run a worker until Ctrl-C, or until its claim loop dies
pub async fn worker(mut config: ScraperConfig, concurrency: Option<usize>) -> Result<()> {
    if let Some(concurrency) = concurrency {
        config.worker.concurrency = concurrency;
        config.validate()?;
    }

    let queue = open_queue(&config).await?;
    let pool = build_pool(&config)?;
    let extractor = Arc::new(SelectorExtractor::new(&config.extraction)?);
    let classifier = Arc::new(ErrorClassifier::new()?);
    let scraper = Arc::new(Scraper::new(&config, extractor, classifier.clone())?);

    let worker = Worker::new(&config, pool, queue, scraper, classifier);
    worker.start().await?;
    info!("Worker running; press Ctrl-C to stop");

    let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);
    status_ticker.tick().await;

    // taken out of the worker on first poll, so it must outlive the loop
    let joined = worker.join();
    tokio::pin!(joined);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupt received; shutting down");
                let report = worker.stop(config.worker.shutdown_timeout()).await;
                log_report(&report);
                return Ok(());
            }
            joined = &mut joined => {
                match joined {
                    Err(e) => error!("Worker crashed: {:#}", e),
                    Ok(()) => error!("Claim loop ended unexpectedly"),
                }
                let report = worker.stop(config.worker.crash_shutdown_timeout()).await;
                log_report(&report);
                anyhow::bail!("Worker stopped after its claim loop died");
            }
            _ = status_ticker.tick() => {
                let status = worker.status();
                let metrics = worker.metrics().get_metrics().await;
                info!(
                    "Status: {} active job(s), {}/{} sessions busy; {} completed, {} retried, {} failed",
                    status.active_jobs,
                    status.pool.active_sessions,
                    status.pool.capacity,
                    metrics.jobs_completed,
                    metrics.jobs_retried,
                    metrics.jobs_failed
                );
            }
        }
    }
}

/// Check that browser sessions and the queue work without claiming jobs
pub async fn dry_run(config: ScraperConfig) -> Result<()> {
    let queue = open_queue(&config).await?;
    let pool = build_pool(&config)?;

    let counts = crate::crawler::worker::dry_run(pool, queue, config.pool.close_timeout()).await?;
    println!("Dry run succeeded");
    print_json(&counts)
}

/// Print the number of jobs per state
pub async fn counts(config: ScraperConfig) -> Result<()> {
    let queue = open_queue(&config).await?;
    let counts = Producer::new(queue.clone(), &config).counts().await?;
    queue.close().await?;
    print_json(&counts)
}

/// Print one job record
pub async fn job(config: ScraperConfig, id: String) -> Result<()> {
    let queue = open_queue(&config).await?;
    let record = Producer::new(queue.clone(), &config).get(&id).await?;
    queue.close().await?;

    match record {
        Some(record) => print_json(&record),
        None => anyhow::bail!("No job with id {}", id),
    }
}

/// Write the default configuration
pub fn init_config(path: Option<PathBuf>) -> Result<()> {
    let config = ScraperConfig::default();
    let path = match path {
        Some(path) => {
            config.save_to_file(&path)?;
            path
        }
        None => config.save_as_default()?,
    };
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Show the current configuration
pub fn show_config(config: &ScraperConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("{}", yaml);
    Ok(())
}
