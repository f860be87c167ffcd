use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Poll interval used when a session cannot be notified of DOM changes
const COUNT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A UI trigger (e.g. "load more", "next page") located by CSS selector
/// or by a case-insensitive substring of its visible text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Affordance {
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub texts: Vec<String>,
}

impl Affordance {
    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty() && self.texts.is_empty()
    }
}

/// Vertical scroll geometry of the current document, in CSS pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ScrollMetrics {
    pub position: f64,
    pub viewport: f64,
    pub height: f64,
}

impl ScrollMetrics {
    /// Distance between the bottom of the viewport and the end of the document
    pub fn remaining(&self) -> f64 {
        (self.height - (self.position + self.viewport)).max(0.0)
    }

    pub fn near_bottom(&self, threshold_px: u64) -> bool {
        self.remaining() <= threshold_px as f64
    }
}

/// One isolated browser execution context. The session is also the page
/// handle: navigation replaces the document it exposes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Stable identifier, for logs
    fn id(&self) -> String;

    fn created_at(&self) -> DateTime<Utc>;

    async fn navigate(&self, url: &str) -> Result<()>;

    async fn html(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// Number of elements matching `selector`
    async fn count_matching(&self, selector: &str) -> Result<usize>;

    /// Wait until more than `previous` elements match `selector`, or until
    /// `timeout` elapses. Returns the count at that moment.
    ///
    /// The default implementation polls; sessions that can observe DOM
    /// mutations should override it.
    async fn wait_for_count_above(&self, selector: &str, previous: usize, timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let count = self.count_matching(selector).await?;
            if count > previous || tokio::time::Instant::now() >= deadline {
                return Ok(count);
            }
            tokio::time::sleep(COUNT_POLL_INTERVAL.min(timeout)).await;
        }
    }

    /// Click the first visible, enabled element matching the affordance.
    /// Returns false when none is present.
    async fn trigger_affordance(&self, affordance: &Affordance) -> Result<bool>;

    /// Scroll vertically by `pixels` (negative scrolls up)
    async fn scroll_by(&self, pixels: i64) -> Result<()>;

    async fn scroll_to_end(&self) -> Result<()>;

    async fn scroll_metrics(&self) -> Result<ScrollMetrics>;

    /// Clear cookies and web storage so the next borrower starts clean
    async fn clear_state(&self) -> Result<()>;

    async fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

const COUNT_SCRIPT: &str = "return document.querySelectorAll(arguments[0]).length;";

const WAIT_FOR_COUNT_SCRIPT: &str = r#"
const selector = arguments[0];
const previous = arguments[1];
const timeoutMs = arguments[2];
const done = arguments[arguments.length - 1];
const count = () => document.querySelectorAll(selector).length;
if (count() > previous) { done(count()); return; }
let finished = false;
let timer = null;
const observer = new MutationObserver(() => { if (count() > previous) finish(); });
function finish() {
  if (finished) return;
  finished = true;
  observer.disconnect();
  if (timer !== null) clearTimeout(timer);
  done(count());
}
observer.observe(document.body || document.documentElement, { childList: true, subtree: true });
timer = setTimeout(finish, timeoutMs);
"#;

const SCROLL_METRICS_SCRIPT: &str = r#"
const doc = document.documentElement;
const body = document.body;
return {
  position: window.scrollY || doc.scrollTop || 0,
  viewport: window.innerHeight || doc.clientHeight || 0,
  height: Math.max(body ? body.scrollHeight : 0, doc.scrollHeight || 0)
};
"#;

const TRIGGER_SCRIPT: &str = r#"
const selectors = arguments[0];
const texts = arguments[1].map(t => t.toLowerCase());
const usable = el => {
  if (!el || el.disabled || el.getAttribute('aria-disabled') === 'true') return false;
  const rect = el.getBoundingClientRect();
  return el.offsetParent !== null && rect.width > 0 && rect.height > 0;
};
const press = el => { el.scrollIntoView({ block: 'center' }); el.click(); return true; };
for (const selector of selectors) {
  let nodes = [];
  try { nodes = document.querySelectorAll(selector); } catch (e) { continue; }
  for (const el of nodes) { if (usable(el)) return press(el); }
}
if (texts.length > 0) {
  for (const el of document.querySelectorAll('button, a, [role="button"]')) {
    const label = (el.innerText || el.textContent || '').trim().toLowerCase();
    if (label && texts.some(t => label.includes(t)) && usable(el)) return press(el);
  }
}
return false;
"#;

const CLEAR_STORAGE_SCRIPT: &str = r#"
try { window.localStorage.clear(); } catch (e) {}
try { window.sessionStorage.clear(); } catch (e) {}
return true;
"#;

/// Browser session backed by a WebDriver connection
pub struct WebDriverSession {
    id: String,
    created_at: DateTime<Utc>,

    /// Taken on close
    driver: Mutex<Option<WebDriver>>,
}

impl WebDriverSession {
    pub fn new(id: String, driver: WebDriver) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            driver: Mutex::new(Some(driver)),
        }
    }

    async fn execute<T>(&self, script: &str, args: Vec<serde_json::Value>) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().context("Browser session closed")?;

        let result = driver.execute(script, args).await
            .context("Failed to execute JavaScript")?;

        result.convert::<T>().context("Failed to parse JavaScript result")
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().context("Browser session closed")?;

        debug!("[{}] Navigating to: {}", self.id, url);
        driver.goto(url).await
            .context(format!("Failed to navigate to URL: {}", url))?;

        Ok(())
    }

    async fn html(&self) -> Result<String> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().context("Browser session closed")?;

        driver.source().await.context("Failed to get page source")
    }

    async fn title(&self) -> Result<String> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().context("Browser session closed")?;

        driver.title().await.context("Failed to get page title")
    }

    async fn count_matching(&self, selector: &str) -> Result<usize> {
        self.execute(COUNT_SCRIPT, vec![json!(selector)]).await
    }

    async fn wait_for_count_above(&self, selector: &str, previous: usize, timeout: Duration) -> Result<usize> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().context("Browser session closed")?;

        let args = vec![json!(selector), json!(previous), json!(timeout.as_millis() as u64)];
        let result = driver.execute_async(WAIT_FOR_COUNT_SCRIPT, args).await
            .context("Failed to observe element count")?;

        result.convert::<usize>().context("Failed to parse element count")
    }

    async fn trigger_affordance(&self, affordance: &Affordance) -> Result<bool> {
        if affordance.is_empty() {
            return Ok(false);
        }
        let triggered: bool = self
            .execute(TRIGGER_SCRIPT, vec![json!(affordance.selectors), json!(affordance.texts)])
            .await?;
        if triggered {
            debug!("[{}] Triggered affordance {:?}", self.id, affordance);
        }
        Ok(triggered)
    }

    async fn scroll_by(&self, pixels: i64) -> Result<()> {
        let _: Option<serde_json::Value> = self
            .execute("window.scrollBy(0, arguments[0]); return null;", vec![json!(pixels)])
            .await?;
        Ok(())
    }

    async fn scroll_to_end(&self) -> Result<()> {
        let _: Option<serde_json::Value> = self
            .execute(
                "window.scrollTo(0, Math.max(document.body ? document.body.scrollHeight : 0, document.documentElement.scrollHeight)); return null;",
                Vec::new(),
            )
            .await?;
        Ok(())
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        self.execute(SCROLL_METRICS_SCRIPT, Vec::new()).await
    }

    async fn clear_state(&self) -> Result<()> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().context("Browser session closed")?;

        driver.delete_all_cookies().await
            .context("Failed to delete cookies")?;
        driver.execute(CLEAR_STORAGE_SCRIPT, Vec::new()).await
            .context("Failed to clear web storage")?;
        driver.goto("about:blank").await
            .context("Failed to reset page")?;

        debug!("[{}] Session state cleared", self.id);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let guard = self.driver.lock().await;
        match guard.as_ref() {
            Some(driver) => driver.title().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let driver = self.driver.lock().await.take();
        if let Some(driver) = driver {
            if let Err(e) = driver.quit().await {
                error!("[{}] Error closing browser session: {}", self.id, e);
                return Err(e).context("Failed to quit WebDriver session");
            }
            debug!("[{}] Browser session closed", self.id);
        }
        Ok(())
    }
}
