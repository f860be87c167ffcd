use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::session::{BrowserSession, WebDriverSession};
use crate::cli::config::BrowserSettings;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Creates sessions and owns whatever process backs them
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Bring up the backing process or verify the remote endpoint
    async fn start(&self) -> Result<()>;

    async fn create_session(&self) -> Result<Arc<dyn BrowserSession>>;

    /// Graceful release of the backing process
    async fn shutdown(&self) -> Result<()>;

    /// Terminate the backing process without any protocol exchange
    async fn force_kill(&self);

    /// Whether `force_kill` reaches the sessions by killing a local
    /// process. When it does not, the pool quits each session itself.
    fn owns_process(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    value: StatusValue,
}

#[derive(Debug, Deserialize)]
struct StatusValue {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Poll `GET {base_url}/status` until the driver reports ready
pub async fn wait_until_ready(client: &Client, base_url: &str, timeout: Duration) -> Result<()> {
    let endpoint = format!("{}/status", base_url.trim_end_matches('/'));
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_problem = String::from("no response");

    loop {
        match client.get(&endpoint).send().await {
            Ok(response) => match response.json::<StatusResponse>().await {
                Ok(status) if status.value.ready => {
                    debug!("WebDriver ready at {}", base_url);
                    return Ok(());
                }
                Ok(status) => {
                    last_problem = status.value.message.unwrap_or_else(|| "not ready".to_string());
                }
                Err(e) => last_problem = format!("unreadable status: {}", e),
            },
            Err(e) => last_problem = e.to_string(),
        }

        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "WebDriver at {} not ready after {} ms: {}",
                base_url,
                timeout.as_millis(),
                last_problem
            );
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Port a local driver should listen on, taken from its URL
fn driver_port(webdriver_url: &str) -> Result<u16> {
    let url = Url::parse(webdriver_url)
        .context(format!("Invalid WebDriver URL: {}", webdriver_url))?;
    url.port_or_known_default()
        .context(format!("WebDriver URL has no port: {}", webdriver_url))
}

/// Chrome sessions over WebDriver, optionally with a locally spawned
/// chromedriver process
pub struct WebDriverProvider {
    settings: BrowserSettings,

    /// Async script timeout; must outlast the longest observe wait
    script_timeout: Duration,

    client: Client,

    /// Spawned driver process, if this provider owns one
    process: Mutex<Option<Child>>,

    session_seq: AtomicU64,
}

impl WebDriverProvider {
    pub fn new(settings: BrowserSettings, longest_observe: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;

        let script_timeout = Duration::from_millis(settings.script_timeout_ms)
            .max(longest_observe + Duration::from_secs(5));

        Ok(Self {
            settings,
            script_timeout,
            client,
            process: Mutex::new(None),
            session_seq: AtomicU64::new(0),
        })
    }

    async fn spawn_driver(&self, path: &str) -> Result<()> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Ok(());
        }

        let port = driver_port(&self.settings.webdriver_url)?;
        info!("Starting chromedriver {} on port {}", path, port);

        let child = Command::new(path)
            .arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to spawn chromedriver: {}", path))?;

        *process = Some(child);
        Ok(())
    }
}

#[async_trait]
impl SessionProvider for WebDriverProvider {
    async fn start(&self) -> Result<()> {
        if let Some(path) = self.settings.chromedriver_path.clone() {
            self.spawn_driver(&path).await?;
        }

        let timeout = Duration::from_millis(self.settings.startup_timeout_ms);
        wait_until_ready(&self.client, &self.settings.webdriver_url, timeout).await
    }

    async fn create_session(&self) -> Result<Arc<dyn BrowserSession>> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            self.settings.viewport.width, self.settings.viewport.height
        ))?;
        caps.add_chrome_arg("--no-first-run")?;
        caps.add_chrome_arg("--no-default-browser-check")?;
        for arg in &self.settings.extra_args {
            caps.add_chrome_arg(arg)?;
        }

        if self.settings.headless {
            caps.set_headless()?;
        }

        let driver = WebDriver::new(&self.settings.webdriver_url, caps).await
            .context("Failed to connect to WebDriver")?;

        driver.set_page_load_timeout(Duration::from_millis(self.settings.page_load_timeout_ms)).await?;
        driver.set_script_timeout(self.script_timeout).await?;

        let seq = self.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("session-{}", seq);
        debug!("Browser session {} created", id);

        Ok(Arc::new(WebDriverSession::new(id, driver)))
    }

    async fn shutdown(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        let Some(mut child) = process.take() else {
            return Ok(());
        };

        let endpoint = format!("{}/shutdown", self.settings.webdriver_url.trim_end_matches('/'));
        if let Err(e) = self.client.get(&endpoint).send().await {
            debug!("chromedriver shutdown request failed: {}", e);
        }

        let grace = Duration::from_millis(self.settings.shutdown_timeout_ms);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!("chromedriver exited with {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("Failed to wait for chromedriver"),
            Err(_) => {
                warn!("chromedriver did not exit within {} ms, killing it", grace.as_millis());
                child.kill().await.context("Failed to kill chromedriver")
            }
        }
    }

    async fn force_kill(&self) {
        let mut process = self.process.lock().await;
        match process.take() {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill chromedriver: {}", e);
                } else {
                    warn!("chromedriver killed");
                }
            }
            None => {
                debug!("No local driver process to kill at {}", self.settings.webdriver_url);
            }
        }
    }

    fn owns_process(&self) -> bool {
        self.settings.chromedriver_path.is_some()
    }
}
