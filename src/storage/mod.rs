pub mod memory_queue;
pub mod queue;
pub mod redis_queue;

// Re-export common types
pub use memory_queue::MemoryQueue;
pub use queue::{
    connect, ClaimedJob, EnqueueOptions, JobRecord, JobState, QueueBackend, QueueCounts, QueueError,
};
pub use redis_queue::RedisQueue;
