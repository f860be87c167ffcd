use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::utils::delay;

/// Upper bound of the random jitter added on top of a base delay (30%).
pub const MAX_JITTER_RATIO: f64 = 0.3;

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub initial_delay_ms: u64,

    /// Ceiling for any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt
    pub factor: f64,

    /// Add up to 30% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay that follows failed attempt `attempt` (1-based):
    /// `min(initial * factor^(attempt - 1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay_ms as f64 * self.factor.max(1.0).powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// Delay after failed attempt `attempt`, including jitter when enabled.
    /// Never below the base delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let max_extra = (base.as_millis() as f64 * MAX_JITTER_RATIO) as u64;
        base + Duration::from_millis(delay::random_between(0, max_extra))
    }
}

/// Final error of a retried operation
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryError<E: fmt::Debug + fmt::Display> {
    /// Attempts made before giving up
    pub attempts: u32,

    /// Error returned by the last attempt
    pub last_error: E,
}

type RetryPredicate<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;
type RetryHook<'a, E> = Box<dyn Fn(&E, u32, Duration) -> BoxFuture<'a, ()> + Send + Sync + 'a>;

/// Retries an async operation according to a [`RetryPolicy`].
///
/// ```ignore
/// let page = Retry::new(policy)
///     .when(|e: &anyhow::Error| is_transient(e))
///     .run(|attempt| async move { fetch(attempt).await })
///     .await?;
/// ```
pub struct Retry<'a, E> {
    policy: RetryPolicy,
    is_retryable: RetryPredicate<'a, E>,
    on_retry: Option<RetryHook<'a, E>>,
}

impl<'a, E> Retry<'a, E>
where
    E: fmt::Debug + fmt::Display + Send,
{
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            is_retryable: Box::new(|_| true),
            on_retry: None,
        }
    }

    /// Only retry errors accepted by `predicate`; others propagate at once.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'a,
    {
        self.is_retryable = Box::new(predicate);
        self
    }

    /// Awaited before every backoff wait with the error, the failed
    /// attempt number and the delay about to be applied.
    pub fn on_retry<H, Fut>(mut self, hook: H) -> Self
    where
        H: Fn(&E, u32, Duration) -> Fut + Send + Sync + 'a,
        Fut: Future<Output = ()> + Send + 'a,
    {
        self.on_retry = Some(Box::new(move |error, attempt, delay| {
            hook(error, attempt, delay).boxed()
        }));
        self
    }

    /// Run `operation` until it succeeds, hits a non-retryable error, or
    /// exhausts `max_attempts`. The closure receives the 1-based attempt.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !(self.is_retryable)(&error) {
                        debug!("Attempt {} failed with non-retryable error: {}", attempt, error);
                        return Err(RetryError { attempts: attempt, last_error: error });
                    }

                    if attempt >= max_attempts {
                        warn!("All {} attempts failed, last error: {}", attempt, error);
                        return Err(RetryError { attempts: attempt, last_error: error });
                    }

                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        "Attempt {}/{} failed: {}; retrying in {} ms",
                        attempt, max_attempts, error, delay.as_millis()
                    );

                    if let Some(hook) = &self.on_retry {
                        hook(&error, attempt, delay).await;
                    }

                    delay::wait(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
