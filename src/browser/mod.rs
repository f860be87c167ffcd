pub mod behavior;
pub mod driver;
pub mod pool;
pub mod session;
#[cfg(test)]
pub mod stub;

// Re-export common types
pub use behavior::BehaviorSimulator;
pub use driver::{SessionProvider, WebDriverProvider};
pub use pool::{PoolError, PoolStatus, SessionPool};
pub use session::{Affordance, BrowserSession, ScrollMetrics};
