use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;

/// Suspend the current task for exactly `duration`.
pub async fn wait(duration: Duration) {
    if !duration.is_zero() {
        sleep(duration).await;
    }
}

/// Draw a uniform value from `[min, max]`. A reversed range is swapped.
pub fn random_between(min: u64, max: u64) -> u64 {
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    if low == high {
        return low;
    }
    thread_rng().gen_range(low..=high)
}

/// Millisecond range drawn with a triangular shape: the mean of two
/// uniform draws, so values cluster around the middle of the range.
pub fn humanized_between(min: u64, max: u64) -> u64 {
    let a = random_between(min, max);
    let b = random_between(min, max);
    (a + b) / 2
}

/// Suspend for a uniformly random duration in `[min_ms, max_ms]` and return it.
pub async fn random_wait(min_ms: u64, max_ms: u64) -> Duration {
    let duration = Duration::from_millis(random_between(min_ms, max_ms));
    wait(duration).await;
    duration
}

/// Suspend for a centre-weighted random duration in `[min_ms, max_ms]`.
pub async fn humanized_wait(min_ms: u64, max_ms: u64) -> Duration {
    let duration = Duration::from_millis(humanized_between(min_ms, max_ms));
    wait(duration).await;
    duration
}

/// True with the given probability. Values outside `[0, 1]` are clamped
/// and NaN never fires.
pub fn chance(probability: f64) -> bool {
    if probability.is_nan() || probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    thread_rng().gen_bool(probability)
}
