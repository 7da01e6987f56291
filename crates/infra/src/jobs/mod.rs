//! Background job system with retry, backoff, de-duplication and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped, typed by [`JobKind`] and placed on a named queue
//! - Retry policy with fixed, linear or exponential backoff
//! - Deterministic dedup keys make re-enqueueing the same logical job a no-op
//! - Groups (e.g. every job a campaign owns) can be paused, resumed and cancelled
//! - Per-queue rate limits keyed by the job's rate key (the sending account)
//! - Dead-letter queue for jobs that exhausted their attempts
//!
//! ## Components
//!
//! - `Job`: core job abstraction with payload and metadata
//! - `JobQueue`: broker contract (in-memory, or Redis with the `redis` feature)
//! - `WorkerPool`: pulls one queue with N workers and routes jobs to handlers

pub mod executor;
pub mod memory;
pub mod queue;
pub mod rate_limit;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod types;

pub use executor::{ExecutorStats, JobHandler, Outcome, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use memory::InMemoryJobQueue;
pub use queue::{JobHandle, JobQueue, JobStats, QueueError};
pub use rate_limit::{FixedWindowLimiter, RateLimit};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use types::{
    BackoffStrategy, DEFAULT_PRIORITY, DeadLetterEntry, Job, JobId, JobKind, JobOptions, JobResult,
    JobStatus, RetryPolicy, queues,
};
