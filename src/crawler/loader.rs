use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::behavior::BehaviorSimulator;
use crate::browser::session::BrowserSession;
use crate::cli::config::LoadingSettings;

const HEIGHT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Height growth below this is treated as layout noise
const HEIGHT_EPSILON_PX: f64 = 1.0;

/// Why a loading run ended. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MinItemsReached,
    Stalled,
    MaxCycles,
    MaxDuration,
}

/// How progress was measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    ItemCount,
    /// No item selector configured; document height growth stands in for
    /// new items
    HeightHeuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleTrace {
    pub cycle: u32,
    pub item_count: usize,
    pub height: f64,
    pub progressed: bool,
    pub escalated: bool,
    pub load_more: bool,
    /// Consecutive stalls after this cycle
    pub stall_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub cycles_run: u32,
    pub final_item_count: usize,
    pub stalled_at_end: bool,
    pub stop_reason: StopReason,
    pub confidence: Confidence,
    pub elapsed_ms: u64,
    pub trace: Vec<CycleTrace>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    count: usize,
    height: f64,
}

/// Scrolls a page until its lazily loaded content stops growing
pub struct ContentLoader {
    settings: LoadingSettings,
    behavior: BehaviorSimulator,
}

impl ContentLoader {
    pub fn new(settings: LoadingSettings) -> Self {
        let behavior = BehaviorSimulator::new(settings.scroll.clone());
        Self { settings, behavior }
    }

    fn selector(&self) -> Option<&str> {
        self.settings
            .item_selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn target_met(&self, count: usize) -> bool {
        self.settings.min_items > 0 && count >= self.settings.min_items
    }

    /// While the selector matches nothing yet, height growth also counts
    /// as progress
    fn progressed(selector: Option<&str>, before: Observation, after: Observation) -> bool {
        let taller = after.height > before.height + HEIGHT_EPSILON_PX;
        match selector {
            Some(_) => after.count > before.count || (after.count == 0 && taller),
            None => taller,
        }
    }

    async fn observe_now(&self, page: &dyn BrowserSession, selector: Option<&str>) -> Result<Observation> {
        let count = match selector {
            Some(selector) => page.count_matching(selector).await?,
            None => 0,
        };
        let height = page.scroll_metrics().await?.height;
        Ok(Observation { count, height })
    }

    /// Wait up to `timeout` for the page to show more than `before`
    async fn observe_change(
        &self,
        page: &dyn BrowserSession,
        selector: Option<&str>,
        before: Observation,
        timeout: Duration,
    ) -> Result<Observation> {
        if let Some(selector) = selector {
            let count = page.wait_for_count_above(selector, before.count, timeout).await?;
            let height = page.scroll_metrics().await?.height;
            return Ok(Observation { count, height });
        }

        let deadline = Instant::now() + timeout;
        loop {
            let height = page.scroll_metrics().await?.height;
            let now = Instant::now();
            if height > before.height + HEIGHT_EPSILON_PX || now >= deadline {
                return Ok(Observation { count: 0, height });
            }
            tokio::time::sleep(HEIGHT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Scroll, trigger "load more" and observe, cycle after cycle, until
    /// the item count stalls or a limit is reached.
    pub async fn load_until_stable(&self, page: &dyn BrowserSession) -> Result<LoadOutcome> {
        let started = Instant::now();
        let max_duration = Duration::from_millis(self.settings.max_duration_ms);
        let observe_timeout = Duration::from_millis(self.settings.observe_timeout_ms);
        let escalated_timeout = Duration::from_millis(self.settings.escalated_observe_timeout_ms);
        let max_stall = self.settings.max_stall_cycles.max(1);

        let selector = self.selector();
        let confidence = match selector {
            Some(_) => Confidence::ItemCount,
            None => {
                warn!("No item selector configured; falling back to page height (lower confidence)");
                Confidence::HeightHeuristic
            }
        };

        let mut current = self.observe_now(page, selector).await?;
        let mut stall = 0u32;
        let mut cycles = 0u32;
        let mut grace_used = false;
        let mut trace = Vec::new();

        debug!("Loading started with {} items, height {}", current.count, current.height);

        let stop_reason = loop {
            if self.target_met(current.count) {
                break StopReason::MinItemsReached;
            }
            if cycles >= self.settings.max_cycles {
                break StopReason::MaxCycles;
            }
            if started.elapsed() >= max_duration {
                break StopReason::MaxDuration;
            }
            cycles += 1;

            self.behavior.scroll_cycle(page).await?;

            let load_more = !self.settings.load_more.is_empty()
                && page.trigger_affordance(&self.settings.load_more).await?;

            let remaining = max_duration.saturating_sub(started.elapsed());
            let mut next = self
                .observe_change(page, selector, current, observe_timeout.min(remaining))
                .await?;
            let mut progressed = Self::progressed(selector, current, next);
            let mut escalated = false;

            if !progressed && stall + 1 >= 2 {
                let metrics = page.scroll_metrics().await?;
                if metrics.near_bottom(self.settings.near_bottom_px) {
                    escalated = true;
                    debug!("Cycle {}: near the bottom, escalating", cycles);
                    page.scroll_to_end().await?;
                    let remaining = max_duration.saturating_sub(started.elapsed());
                    next = self
                        .observe_change(page, selector, current, escalated_timeout.min(remaining))
                        .await?;
                    progressed = Self::progressed(selector, current, next);
                }
            }

            if progressed {
                stall = 0;
                grace_used = false;
                current = next;
            } else if load_more && !grace_used {
                // the affordance fired, so give it one more cycle
                grace_used = true;
            } else {
                stall += 1;
            }

            debug!(
                "Cycle {}: {} items, height {}, stall {}/{}{}{}",
                cycles,
                current.count,
                current.height,
                stall,
                max_stall,
                if escalated { ", escalated" } else { "" },
                if load_more { ", load more" } else { "" },
            );

            trace.push(CycleTrace {
                cycle: cycles,
                item_count: current.count,
                height: current.height,
                progressed,
                escalated,
                load_more,
                stall_count: stall,
            });

            if stall >= max_stall {
                break StopReason::Stalled;
            }
        };

        let outcome = LoadOutcome {
            cycles_run: cycles,
            final_item_count: current.count,
            stalled_at_end: stop_reason == StopReason::Stalled,
            stop_reason,
            confidence,
            elapsed_ms: started.elapsed().as_millis() as u64,
            trace,
        };

        info!(
            "Loading finished after {} cycles with {} items ({:?})",
            outcome.cycles_run, outcome.final_item_count, outcome.stop_reason
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::session::{Affordance, MockBrowserSession, ScrollMetrics};
    use crate::browser::stub::{StubListing, StubPage, StubSite};
    use crate::cli::config::ScrollBehavior;

    fn quiet_scroll() -> ScrollBehavior {
        ScrollBehavior {
            distance_px: (400, 600),
            steps_per_cycle: (2, 3),
            step_delay_ms: (100, 200),
            reading_pause_chance: 0.0,
            reading_pause_ms: (0, 0),
            reverse_scroll_chance: 0.0,
            reverse_scroll_px: (0, 0),
        }
    }

    fn settings() -> LoadingSettings {
        LoadingSettings {
            scroll: quiet_scroll(),
            ..LoadingSettings::default()
        }
    }

    async fn stub_page(listing: StubListing) -> StubPage {
        let page = StubPage::new("loader".to_string(), StubSite::new(vec![listing]));
        page.navigate("https://shop.example.com/search?q=tv").await.unwrap();
        page
    }

    #[tokio::test(start_paused = true)]
    async fn flat_page_stops_after_max_stall_cycles() {
        let page = stub_page(StubListing::flat("Results", 10)).await;
        let loader = ContentLoader::new(settings());

        let outcome = loader.load_until_stable(&page).await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Stalled);
        assert!(outcome.stalled_at_end);
        assert_eq!(outcome.cycles_run, 4);
        assert!(outcome.cycles_run <= settings().max_cycles);
        assert_eq!(outcome.final_item_count, 10);
        assert!(outcome.trace.iter().any(|c| c.escalated));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_stall_counter() {
        let mut page = MockBrowserSession::new();
        let mut counts = vec![10usize, 20, 20, 20, 30].into_iter();
        page.expect_count_matching().returning(|_| Ok(0));
        page.expect_scroll_by().returning(|_| Ok(()));
        page.expect_scroll_metrics().returning(|| {
            Ok(ScrollMetrics {
                position: 0.0,
                viewport: 900.0,
                height: 100_000.0,
            })
        });
        page.expect_wait_for_count_above()
            .returning(move |_, _, _| Ok(counts.next().unwrap_or(30)));

        let loader = ContentLoader::new(LoadingSettings {
            max_stall_cycles: 3,
            max_cycles: 20,
            load_more: Affordance::default(),
            ..settings()
        });
        let outcome = loader.load_until_stable(&page).await.unwrap();

        let stalls: Vec<u32> = outcome.trace.iter().map(|c| c.stall_count).collect();
        assert_eq!(stalls, vec![0, 0, 1, 2, 0, 1, 2, 3]);
        assert!(outcome.trace[4].progressed);
        assert_eq!(outcome.final_item_count, 30);
        assert_eq!(outcome.stop_reason, StopReason::Stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn min_items_target_ends_the_run() {
        let page = stub_page(StubListing::growing(0, 10, 10)).await;
        let loader = ContentLoader::new(LoadingSettings {
            min_items: 25,
            ..settings()
        });

        let outcome = loader.load_until_stable(&page).await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::MinItemsReached);
        assert_eq!(outcome.cycles_run, 3);
        assert_eq!(outcome.final_item_count, 30);
        assert!(!outcome.stalled_at_end);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_ceiling_is_a_successful_stop() {
        let page = stub_page(StubListing::growing(0, 10, 100)).await;
        let loader = ContentLoader::new(LoadingSettings {
            max_cycles: 3,
            ..settings()
        });

        let outcome = loader.load_until_stable(&page).await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::MaxCycles);
        assert_eq!(outcome.cycles_run, 3);
        assert_eq!(outcome.final_item_count, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn load_more_affordance_reveals_gated_content() {
        let listing = StubListing {
            title: "Results".to_string(),
            initial: 10,
            batches: vec![10, 10],
            load_more_only: true,
            ..StubListing::default()
        };
        let page = stub_page(listing).await;
        let loader = ContentLoader::new(settings());

        let outcome = loader.load_until_stable(&page).await.unwrap();

        assert_eq!(outcome.final_item_count, 30);
        assert!(outcome.trace[0].load_more && outcome.trace[0].progressed);
        assert!(outcome.trace[1].load_more && outcome.trace[1].progressed);
        assert!(!outcome.trace[2].load_more);
        assert_eq!(outcome.stop_reason, StopReason::Stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_selector_falls_back_to_height() {
        let page = stub_page(StubListing::growing(5, 5, 2)).await;
        let loader = ContentLoader::new(LoadingSettings {
            item_selector: None,
            ..settings()
        });

        let outcome = loader.load_until_stable(&page).await.unwrap();

        assert_eq!(outcome.confidence, Confidence::HeightHeuristic);
        assert_eq!(outcome.trace.iter().filter(|c| c.progressed).count(), 2);
        assert_eq!(outcome.stop_reason, StopReason::Stalled);
        assert_eq!(outcome.final_item_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_ceiling_is_respected() {
        let page = stub_page(StubListing::flat("Results", 10)).await;
        let loader = ContentLoader::new(LoadingSettings {
            max_stall_cycles: 100,
            max_cycles: 100,
            max_duration_ms: 10_000,
            ..settings()
        });

        let outcome = loader.load_until_stable(&page).await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::MaxDuration);
        assert!(outcome.elapsed_ms <= 11_000);
    }
}
