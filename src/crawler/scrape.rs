use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::session::BrowserSession;
use crate::cli::config::{ScraperConfig, SiteSettings};
use crate::crawler::errors::{ErrorClassifier, ErrorKind, ScrapeError};
use crate::crawler::extract::Extractor;
use crate::crawler::loader::ContentLoader;
use crate::crawler::task::{Job, ScrapeResult};
use crate::utils::delay;
use crate::utils::retry::{Retry, RetryPolicy};

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).context(format!("Invalid marker pattern: {}", p)))
        .collect()
}

/// Recognises block, challenge and rate-limit pages from their text
pub struct PageInspector {
    challenge: Vec<Regex>,
    rate_limit: Vec<Regex>,
    block: Vec<Regex>,
}

impl PageInspector {
    pub fn new(site: &SiteSettings) -> Result<Self> {
        Ok(Self {
            challenge: compile(&site.challenge_markers)?,
            rate_limit: compile(&site.rate_limit_markers)?,
            block: compile(&site.block_markers)?,
        })
    }

    /// First matching marker, checked challenge first, then rate limit,
    /// then block
    pub fn inspect(&self, text: &str) -> Option<ScrapeError> {
        let hit = |markers: &[Regex]| markers.iter().find(|m| m.is_match(text)).map(|m| m.as_str().to_string());

        if let Some(marker) = hit(&self.challenge) {
            return Some(ScrapeError::Challenge(format!("page matched {}", marker)));
        }
        if let Some(marker) = hit(&self.rate_limit) {
            return Some(ScrapeError::RateLimited(format!("page matched {}", marker)));
        }
        if let Some(marker) = hit(&self.block) {
            return Some(ScrapeError::Blocked(format!("page matched {}", marker)));
        }
        None
    }
}

/// Runs one job against a borrowed browser session
pub struct Scraper {
    site: SiteSettings,
    loader: ContentLoader,
    extractor: Arc<dyn Extractor>,
    inspector: PageInspector,
    navigation: RetryPolicy,
    classifier: Arc<ErrorClassifier>,
}

impl Scraper {
    pub fn new(
        config: &ScraperConfig,
        extractor: Arc<dyn Extractor>,
        classifier: Arc<ErrorClassifier>,
    ) -> Result<Self> {
        Ok(Self {
            site: config.site.clone(),
            loader: ContentLoader::new(config.loading.clone()),
            extractor,
            inspector: PageInspector::new(&config.site)?,
            navigation: config.retry.navigation.clone(),
            classifier,
        })
    }

    /// `scrape` bounded by an overall deadline
    pub async fn run(&self, page: &dyn BrowserSession, job: &Job, deadline: Duration) -> Result<ScrapeResult> {
        match tokio::time::timeout(deadline, self.scrape(page, job)).await {
            Ok(result) => result,
            Err(elapsed) => Err(anyhow::Error::new(elapsed).context(ScrapeError::Timeout(format!(
                "job {} exceeded {} ms",
                job.label(),
                deadline.as_millis()
            )))),
        }
    }

    async fn navigate(&self, page: &dyn BrowserSession, url: &str) -> Result<()> {
        let classifier = self.classifier.as_ref();

        Retry::new(self.navigation.clone())
            .when(|e: &anyhow::Error| classifier.is_transient(e))
            .on_retry(|e: &anyhow::Error, attempt, delay| {
                warn!(
                    "Navigation attempt {} to {} failed: {:#}; retrying in {} ms",
                    attempt,
                    url,
                    e,
                    delay.as_millis()
                );
                async {}
            })
            .run(|_attempt| page.navigate(url))
            .await
            .map_err(|e| {
                let attempts = e.attempts;
                let kind = classifier.classify(&e.last_error);
                let error = e.last_error.context(format!("Navigation failed after {} attempt(s)", attempts));
                match kind {
                    ErrorKind::NetworkFailure => error.context(ScrapeError::Network(url.to_string())),
                    ErrorKind::Timeout => error.context(ScrapeError::Timeout(url.to_string())),
                    _ => error,
                }
            })
    }

    async fn settle(&self) {
        let (min_ms, max_ms) = self.site.settle_delay_ms;
        delay::random_wait(min_ms, max_ms).await;
    }

    /// Navigate, load every result page up to `maxPages`, and extract
    pub async fn scrape(&self, page: &dyn BrowserSession, job: &Job) -> Result<ScrapeResult> {
        let started = Instant::now();
        let url = job.target_url(&self.site)?;
        info!("Scraping {} ({} page(s) max)", url, job.max_pages);

        self.navigate(page, &url).await?;
        self.settle().await;

        let title = page.title().await?;
        if let Some(problem) = self.inspector.inspect(&title) {
            return Err(problem.into());
        }

        let mut products = Vec::new();
        let mut pages_scraped = 0;

        for page_number in 1..=job.max_pages {
            pages_scraped = page_number;

            let outcome = self.loader.load_until_stable(page).await?;
            let html = page.html().await?;
            let records = self.extractor.extract(&html)?;
            debug!(
                "Page {}: {} records from {} loaded items ({:?})",
                page_number,
                records.len(),
                outcome.final_item_count,
                outcome.stop_reason
            );

            if records.is_empty() {
                if page_number > 1 {
                    debug!("Page {} is empty; stopping pagination", page_number);
                    break;
                }
                if let Some(problem) = self.inspector.inspect(&html) {
                    return Err(problem.into());
                }
                return Err(ScrapeError::SelectorMissing(format!(
                    "no records extracted from {} ({} items matched while loading)",
                    url, outcome.final_item_count
                ))
                .into());
            }

            products.extend(records);

            if page_number == job.max_pages {
                break;
            }
            if !page.trigger_affordance(&self.site.next_page).await? {
                debug!("No next page after page {}", page_number);
                break;
            }
            self.settle().await;
        }

        let result = ScrapeResult {
            success: true,
            keyword: job.keyword.clone(),
            url,
            total_products: products.len(),
            pages_scraped,
            duration_ms: started.elapsed().as_millis() as u64,
            scraped_at: Utc::now(),
            products,
        };

        info!(
            "Scraped {} products from {} page(s) in {} ms",
            result.total_products, result.pages_scraped, result.duration_ms
        );

        Ok(result)
    }
}
