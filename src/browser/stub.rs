//! Scriptable in-process browser used by tests.
//!
//! A `StubSite` describes the listings a session will see; each listing
//! reveals its items in batches. A batch appears on the first read after
//! the page was scrolled (or after "load more" was clicked, when gated).
//! Sessions track cookies so cleanup can be observed from outside the pool.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::driver::SessionProvider;
use crate::browser::session::{Affordance, BrowserSession, ScrollMetrics};
use crate::cli::config::{LoadingSettings, SiteSettings};

const VIEWPORT_PX: f64 = 900.0;
const BASE_HEIGHT_PX: f64 = 1_200.0;
const ITEM_HEIGHT_PX: f64 = 120.0;

/// One result page
#[derive(Debug, Clone, Default)]
pub struct StubListing {
    pub title: String,
    pub body: String,
    pub initial: usize,
    pub batches: Vec<usize>,
    /// Batches appear only after the load-more affordance is triggered
    pub load_more_only: bool,
}

impl StubListing {
    pub fn growing(initial: usize, batch: usize, cycles: usize) -> Self {
        Self {
            title: "Search results".to_string(),
            initial,
            batches: vec![batch; cycles],
            ..Self::default()
        }
    }

    /// Same contents every cycle, with the given title
    pub fn flat(title: &str, items: usize) -> Self {
        Self {
            title: title.to_string(),
            initial: items,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StubSite {
    pub item_selector: String,
    pub listings: Vec<StubListing>,
    pub next_page: Affordance,
    pub load_more: Affordance,
    navigation_failures: Arc<Mutex<VecDeque<String>>>,
}

impl StubSite {
    pub fn new(listings: Vec<StubListing>) -> Self {
        Self {
            item_selector: "[data-product-id]".to_string(),
            listings,
            next_page: SiteSettings::default().next_page,
            load_more: LoadingSettings::default().load_more,
            navigation_failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// The next `messages.len()` navigations, across all sessions, fail
    pub fn fail_navigations(&self, messages: &[&str]) {
        if let Ok(mut failures) = self.navigation_failures.lock() {
            failures.extend(messages.iter().map(|m| m.to_string()));
        }
    }

    fn next_navigation_failure(&self) -> Option<String> {
        self.navigation_failures.lock().ok()?.pop_front()
    }
}

#[derive(Debug, Default)]
struct PageState {
    url: Option<String>,
    listing: usize,
    count: usize,
    next_batch: usize,
    scrolled: bool,
    load_more_pending: bool,
    position: f64,
    cookies: Vec<String>,
    closed: bool,
}

pub struct StubPage {
    id: String,
    created_at: DateTime<Utc>,
    site: StubSite,
    state: Mutex<PageState>,
}

impl StubPage {
    pub fn new(id: String, site: StubSite) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            site,
            state: Mutex::new(PageState::default()),
        }
    }

    pub fn cookies(&self) -> Vec<String> {
        self.lock().map(|s| s.cookies.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PageState>> {
        match self.state.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => bail!("stub page state poisoned"),
        }
    }

    fn open_state(&self) -> Result<std::sync::MutexGuard<'_, PageState>> {
        let state = self.lock()?;
        if state.closed {
            bail!("Browser session closed");
        }
        Ok(state)
    }

    fn listing(&self, state: &PageState) -> Option<&StubListing> {
        state.url.as_ref()?;
        self.site.listings.get(state.listing)
    }

    fn show_listing(&self, state: &mut PageState, index: usize) {
        state.listing = index;
        state.count = self.site.listings.get(index).map(|l| l.initial).unwrap_or(0);
        state.next_batch = 0;
        state.scrolled = false;
        state.load_more_pending = false;
        state.position = 0.0;
    }

    fn height(state: &PageState) -> f64 {
        BASE_HEIGHT_PX + state.count as f64 * ITEM_HEIGHT_PX
    }

    /// Reveal the next batch if the page has been given a reason to load
    fn settle(&self, state: &mut PageState) {
        let Some(listing) = self.listing(state).cloned() else {
            return;
        };
        let triggered = if listing.load_more_only {
            state.load_more_pending
        } else {
            state.scrolled || state.load_more_pending
        };
        if triggered {
            if let Some(batch) = listing.batches.get(state.next_batch) {
                state.count += batch;
                state.next_batch += 1;
            }
        }
        state.scrolled = false;
        state.load_more_pending = false;
    }
}

#[async_trait]
impl BrowserSession for StubPage {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        if let Some(message) = self.site.next_navigation_failure() {
            bail!("{}", message);
        }
        let mut state = self.open_state()?;
        state.url = Some(url.to_string());
        state.cookies.push(format!("visit={}", url));
        self.show_listing(&mut state, 0);
        Ok(())
    }

    async fn html(&self) -> Result<String> {
        let state = self.open_state()?;
        let Some(listing) = self.listing(&state) else {
            return Ok("<html><head></head><body></body></html>".to_string());
        };

        let mut html = format!(
            "<html><head><title>{}</title></head><body><p>{}</p>",
            listing.title, listing.body
        );
        for i in 0..state.count {
            html.push_str(&format!(
                "<div data-product-id=\"p{}-{}\"><h2>Item {}</h2><span class=\"price\">$ {}.99</span><a href=\"/item/{}\">view</a></div>",
                state.listing, i, i, i + 1, i
            ));
        }
        html.push_str("</body></html>");
        Ok(html)
    }

    async fn title(&self) -> Result<String> {
        let state = self.open_state()?;
        Ok(self.listing(&state).map(|l| l.title.clone()).unwrap_or_default())
    }

    async fn count_matching(&self, selector: &str) -> Result<usize> {
        let mut state = self.open_state()?;
        self.settle(&mut state);
        if selector == self.site.item_selector && self.listing(&state).is_some() {
            Ok(state.count)
        } else {
            Ok(0)
        }
    }

    async fn wait_for_count_above(&self, selector: &str, previous: usize, timeout: Duration) -> Result<usize> {
        let count = {
            let mut state = self.open_state()?;
            self.settle(&mut state);
            if selector == self.site.item_selector { state.count } else { 0 }
        };
        if count > previous {
            return Ok(count);
        }
        tokio::time::sleep(timeout).await;
        Ok(count)
    }

    async fn trigger_affordance(&self, affordance: &Affordance) -> Result<bool> {
        let mut state = self.open_state()?;
        if self.listing(&state).is_none() {
            return Ok(false);
        }

        if *affordance == self.site.next_page {
            let next = state.listing + 1;
            if next < self.site.listings.len() {
                self.show_listing(&mut state, next);
                return Ok(true);
            }
            return Ok(false);
        }

        if *affordance == self.site.load_more {
            let remaining = self
                .listing(&state)
                .map(|l| l.load_more_only && state.next_batch < l.batches.len())
                .unwrap_or(false);
            if remaining {
                state.load_more_pending = true;
            }
            return Ok(remaining);
        }

        Ok(false)
    }

    async fn scroll_by(&self, pixels: i64) -> Result<()> {
        let mut state = self.open_state()?;
        let max = (Self::height(&state) - VIEWPORT_PX).max(0.0);
        state.position = (state.position + pixels as f64).clamp(0.0, max);
        if pixels > 0 {
            state.scrolled = true;
        }
        Ok(())
    }

    async fn scroll_to_end(&self) -> Result<()> {
        let mut state = self.open_state()?;
        state.position = (Self::height(&state) - VIEWPORT_PX).max(0.0);
        state.scrolled = true;
        Ok(())
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        let mut state = self.open_state()?;
        self.settle(&mut state);
        Ok(ScrollMetrics {
            position: state.position,
            viewport: VIEWPORT_PX,
            height: Self::height(&state),
        })
    }

    async fn clear_state(&self) -> Result<()> {
        let mut state = self.open_state()?;
        state.cookies.clear();
        state.url = None;
        state.position = 0.0;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.closed = true;
        Ok(())
    }
}

/// Provider handing out `StubPage`s for one `StubSite`
pub struct StubProvider {
    site: StubSite,
    pages: Mutex<Vec<Arc<StubPage>>>,
    fail_start: bool,
    owns_process: bool,
    started: AtomicBool,
    shut_down: AtomicBool,
    killed: AtomicBool,
    created: AtomicUsize,
}

impl StubProvider {
    pub fn new(site: StubSite) -> Self {
        Self {
            site,
            pages: Mutex::new(Vec::new()),
            fail_start: false,
            owns_process: true,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    pub fn failing_start(site: StubSite) -> Self {
        Self {
            fail_start: true,
            ..Self::new(site)
        }
    }

    /// Sessions live on a driver this provider does not run, so killing
    /// the provider leaves them open
    pub fn remote(site: StubSite) -> Self {
        Self {
            owns_process: false,
            ..Self::new(site)
        }
    }

    pub fn page(&self, id: &str) -> Option<Arc<StubPage>> {
        let pages = self.pages.lock().ok()?;
        pages.iter().find(|p| p.id == id).cloned()
    }

    pub fn pages(&self) -> Vec<Arc<StubPage>> {
        self.pages.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for StubProvider {
    async fn start(&self) -> Result<()> {
        if self.fail_start {
            bail!("driver did not become ready");
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_session(&self) -> Result<Arc<dyn BrowserSession>> {
        let seq = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let page = Arc::new(StubPage::new(format!("stub-{}", seq), self.site.clone()));
        if let Ok(mut pages) = self.pages.lock() {
            pages.push(page.clone());
        }
        Ok(page)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn force_kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if !self.owns_process {
            return;
        }
        if let Ok(pages) = self.pages.lock() {
            for page in pages.iter() {
                if let Ok(mut state) = page.state.lock() {
                    state.closed = true;
                }
            }
        }
    }

    fn owns_process(&self) -> bool {
        self.owns_process
    }
}
