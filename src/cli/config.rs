use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::browser::session::Affordance;
use crate::utils::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ScraperConfig {
    pub site: SiteSettings,
    pub browser: BrowserSettings,
    pub pool: PoolSettings,
    pub loading: LoadingSettings,
    pub extraction: ExtractionSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub retry: RetrySettings,
}

/// Target site settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SiteSettings {
    pub base_url: String,
    pub search_path: String,
    pub search_param: String,
    pub default_max_pages: u32,
    pub settle_delay_ms: (u64, u64), // Wait after navigation, min and max
    pub block_markers: Vec<String>,     // Regexes, matched case-insensitively
    pub challenge_markers: Vec<String>,
    pub rate_limit_markers: Vec<String>,
    pub next_page: Affordance,
}

/// WebDriver / browser process settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub chromedriver_path: Option<String>, // Spawn and own a driver process when set
    pub headless: bool,
    pub viewport: Viewport,
    pub extra_args: Vec<String>,
    pub page_load_timeout_ms: u64,
    pub script_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Session pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity: usize,
    pub close_timeout_ms: u64,
}

/// Content loading (scroll / stall detection) settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoadingSettings {
    pub item_selector: Option<String>,
    pub min_items: usize, // 0 disables the target
    pub max_cycles: u32,
    pub max_stall_cycles: u32,
    pub observe_timeout_ms: u64,
    pub escalated_observe_timeout_ms: u64,
    pub max_duration_ms: u64,
    pub near_bottom_px: u64,
    pub load_more: Affordance,
    pub scroll: ScrollBehavior,
}

/// Scroll pacing settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScrollBehavior {
    pub distance_px: (u64, u64),      // Min and max distance of one scroll step
    pub steps_per_cycle: (u32, u32),  // Min and max scroll steps per cycle
    pub step_delay_ms: (u64, u64),    // Min and max delay after a step
    pub reading_pause_chance: f64,
    pub reading_pause_ms: (u64, u64),
    pub reverse_scroll_chance: f64,
    pub reverse_scroll_px: (u64, u64),
}

/// Record extraction settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionSettings {
    pub item_selector: String,
    pub fields: Vec<FieldSelector>,
}

/// One extracted field: CSS selector relative to the item (empty means the
/// item itself), optional attribute
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FieldSelector {
    pub name: String,
    pub selector: String,
    #[serde(default)]
    pub attribute: Option<String>,
}

/// Queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: String, // "redis", "memory"
    pub redis_url: String,
    pub key_prefix: String,
    pub lease_ms: u64,
    pub default_priority: i32,
    pub completed_retention: RetentionSettings,
    pub failed_retention: RetentionSettings,
}

/// How many finished jobs to keep, and for how long
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetentionSettings {
    pub max_count: usize,
    pub max_age_secs: u64,
}

/// Worker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub job_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub crash_shutdown_timeout_ms: u64,
}

/// Backoff curve for one error class
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

/// Job retry settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub jitter: bool,
    pub standard: BackoffSettings,
    pub rate_limited: BackoffSettings,
    pub blocked: BackoffSettings,
    pub challenge: BackoffSettings,
    pub selector_missing: BackoffSettings,
    pub blocked_max_attempts: u32,
    pub selector_missing_max_attempts: u32,
    pub navigation: RetryPolicy,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            base_url: "https://shop.example.com".to_string(),
            search_path: "/search".to_string(),
            search_param: "q".to_string(),
            default_max_pages: 1,
            settle_delay_ms: (800, 1_600),
            block_markers: vec![
                r"access denied".to_string(),
                r"you have been blocked".to_string(),
                r"\b403\b.*forbidden".to_string(),
            ],
            challenge_markers: vec![
                r"captcha".to_string(),
                r"verify (that )?you are (a )?human".to_string(),
                r"unusual traffic".to_string(),
            ],
            rate_limit_markers: vec![
                r"too many requests".to_string(),
                r"\b429\b".to_string(),
            ],
            next_page: Affordance {
                selectors: vec!["a[rel='next']".to_string(), "a.pagination-next".to_string()],
                texts: vec!["next".to_string()],
            },
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            chromedriver_path: None,
            headless: true,
            viewport: Viewport {
                width: 1366,
                height: 900,
            },
            extra_args: vec!["--disable-dev-shm-usage".to_string()],
            page_load_timeout_ms: 45_000,
            script_timeout_ms: 30_000,
            startup_timeout_ms: 20_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 2,
            close_timeout_ms: 15_000,
        }
    }
}

impl Default for LoadingSettings {
    fn default() -> Self {
        Self {
            item_selector: Some("[data-product-id]".to_string()),
            min_items: 0,
            max_cycles: 40,
            max_stall_cycles: 4,
            observe_timeout_ms: 3_000,
            escalated_observe_timeout_ms: 8_000,
            max_duration_ms: 180_000,
            near_bottom_px: 600,
            load_more: Affordance {
                selectors: vec!["button.load-more".to_string()],
                texts: vec!["load more".to_string(), "show more".to_string()],
            },
            scroll: ScrollBehavior::default(),
        }
    }
}

impl Default for ScrollBehavior {
    fn default() -> Self {
        Self {
            distance_px: (350, 800),
            steps_per_cycle: (2, 4),
            step_delay_ms: (250, 700),
            reading_pause_chance: 0.1,
            reading_pause_ms: (1_500, 4_000),
            reverse_scroll_chance: 0.05,
            reverse_scroll_px: (80, 240),
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            item_selector: "[data-product-id]".to_string(),
            fields: vec![
                FieldSelector {
                    name: "id".to_string(),
                    selector: String::new(),
                    attribute: Some("data-product-id".to_string()),
                },
                FieldSelector {
                    name: "title".to_string(),
                    selector: "h2, .product-title".to_string(),
                    attribute: None,
                },
                FieldSelector {
                    name: "price".to_string(),
                    selector: ".price".to_string(),
                    attribute: None,
                },
                FieldSelector {
                    name: "url".to_string(),
                    selector: "a[href]".to_string(),
                    attribute: Some("href".to_string()),
                },
                FieldSelector {
                    name: "image".to_string(),
                    selector: "img".to_string(),
                    attribute: Some("src".to_string()),
                },
            ],
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: "redis".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "scraper".to_string(),
            lease_ms: 120_000,
            default_priority: 10,
            completed_retention: RetentionSettings {
                max_count: 1_000,
                max_age_secs: 24 * 3_600,
            },
            failed_retention: RetentionSettings {
                max_count: 5_000,
                max_age_secs: 7 * 24 * 3_600,
            },
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_ms: 1_000,
            error_backoff_ms: 5_000,
            job_timeout_ms: 600_000,
            shutdown_timeout_ms: 60_000,
            crash_shutdown_timeout_ms: 10_000,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            jitter: true,
            standard: BackoffSettings {
                initial_delay_ms: 5_000,
                factor: 2.0,
                max_delay_ms: 300_000,
            },
            rate_limited: BackoffSettings {
                initial_delay_ms: 30_000,
                factor: 3.0,
                max_delay_ms: 1_800_000,
            },
            blocked: BackoffSettings {
                initial_delay_ms: 120_000,
                factor: 4.0,
                max_delay_ms: 3_600_000,
            },
            challenge: BackoffSettings {
                initial_delay_ms: 60_000,
                factor: 2.0,
                max_delay_ms: 1_800_000,
            },
            selector_missing: BackoffSettings {
                initial_delay_ms: 10_000,
                factor: 2.0,
                max_delay_ms: 600_000,
            },
            blocked_max_attempts: 2,
            selector_missing_max_attempts: 3,
            navigation: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1_000,
                max_delay_ms: 10_000,
                factor: 2.0,
                jitter: true,
            },
        }
    }
}

impl PoolSettings {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl WorkerSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn crash_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.crash_shutdown_timeout_ms)
    }
}

impl QueueSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl ScraperConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "shop-scraper", "shop-scraper") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load from an explicit path, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_default(),
        }
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating {}", config_path.display());
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Parse a YAML document; missing sections and fields take defaults
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            anyhow::bail!("pool.capacity must be at least 1");
        }
        if self.worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be at least 1");
        }
        if self.loading.max_stall_cycles == 0 {
            anyhow::bail!("loading.max_stall_cycles must be at least 1");
        }
        if self.site.default_max_pages == 0 {
            anyhow::bail!("site.default_max_pages must be at least 1");
        }
        url::Url::parse(&self.site.base_url)
            .context(format!("Invalid site.base_url: {}", self.site.base_url))?;

        let scroll = &self.loading.scroll;
        check_probability("loading.scroll.reading_pause_chance", scroll.reading_pause_chance)?;
        check_probability("loading.scroll.reverse_scroll_chance", scroll.reverse_scroll_chance)?;
        check_range("site.settle_delay_ms", self.site.settle_delay_ms)?;
        check_range("loading.scroll.distance_px", scroll.distance_px)?;
        check_range("loading.scroll.steps_per_cycle", scroll.steps_per_cycle)?;
        check_range("loading.scroll.step_delay_ms", scroll.step_delay_ms)?;
        check_range("loading.scroll.reading_pause_ms", scroll.reading_pause_ms)?;
        check_range("loading.scroll.reverse_scroll_px", scroll.reverse_scroll_px)?;
        Ok(())
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<PathBuf> {
        let config_path = Self::default_path();
        self.save_to_file(&config_path)?;
        Ok(config_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

fn check_probability(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be between 0 and 1, got {}", name, value);
    }
    Ok(())
}

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, (min, max): (T, T)) -> Result<()> {
    if min > max {
        anyhow::bail!("{} has min {} above max {}", name, min, max);
    }
    Ok(())
}
