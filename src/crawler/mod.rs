pub mod errors;
pub mod extract;
pub mod loader;
pub mod producer;
pub mod scrape;
pub mod task;
pub mod worker;

// Re-export common types
pub use errors::{BackoffTable, ErrorClassifier, ErrorKind, RetryDecision, ScrapeError};
pub use extract::{Extractor, SelectorExtractor};
pub use loader::{ContentLoader, LoadOutcome, StopReason};
pub use producer::{parse_bulk_file, Producer};
pub use scrape::{PageInspector, Scraper};
pub use task::{Job, JobSpec, LastError, ScrapeResult};
pub use worker::{dry_run, StopReport, Worker, WorkerEvent, WorkerState, WorkerStatus};
