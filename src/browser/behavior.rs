use anyhow::Result;
use tracing::debug;

use crate::browser::session::BrowserSession;
use crate::cli::config::ScrollBehavior;
use crate::utils::delay;

/// Paced scrolling for one content-loading cycle
pub struct BehaviorSimulator {
    /// Configuration for scroll pacing
    config: ScrollBehavior,
}

impl BehaviorSimulator {
    /// Create a new behavior simulator with the given configuration
    pub fn new(config: ScrollBehavior) -> Self {
        Self { config }
    }

    /// Scroll down in a few bounded steps with randomized pauses.
    ///
    /// Occasionally pauses longer or nudges back up a little; neither
    /// affects what the loader observes afterwards. Returns the net
    /// distance scrolled in pixels.
    pub async fn scroll_cycle(&self, page: &dyn BrowserSession) -> Result<i64> {
        let (min_steps, max_steps) = self.config.steps_per_cycle;
        let steps = delay::random_between(min_steps.max(1) as u64, max_steps.max(1) as u64);

        let mut scrolled = 0i64;
        for _ in 0..steps {
            let (min_px, max_px) = self.config.distance_px;
            let distance = delay::random_between(min_px, max_px) as i64;
            page.scroll_by(distance).await?;
            scrolled += distance;

            let (min_ms, max_ms) = self.config.step_delay_ms;
            delay::humanized_wait(min_ms, max_ms).await;
        }

        if delay::chance(self.config.reading_pause_chance) {
            let (min_ms, max_ms) = self.config.reading_pause_ms;
            let paused = delay::random_wait(min_ms, max_ms).await;
            debug!("Reading pause of {} ms", paused.as_millis());
        }

        if delay::chance(self.config.reverse_scroll_chance) {
            let (min_px, max_px) = self.config.reverse_scroll_px;
            let back = delay::random_between(min_px, max_px) as i64;
            page.scroll_by(-back).await?;
            scrolled -= back;
            let (min_ms, max_ms) = self.config.step_delay_ms;
            delay::random_wait(min_ms, max_ms).await;
        }

        debug!("Scrolled {} pixels in {} steps", scrolled, steps);

        Ok(scrolled)
    }
}
