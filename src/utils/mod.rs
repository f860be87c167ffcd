pub mod delay;
pub mod logging;
pub mod metrics;
pub mod retry;

// Re-export common functions and types
pub use logging::{default_log_file, init_logging};
pub use metrics::{AttemptOutcome, JobTimer, Metrics, MetricsCollector};
pub use retry::{Retry, RetryError, RetryPolicy};
