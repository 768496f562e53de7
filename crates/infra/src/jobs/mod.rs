//! Background job system with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs are routed to handlers by task name (`process_order`, ...)
//! - Retries are bounded by attempt count with exponential backoff
//! - Dead-letter queue for permanent failures and exhausted retries
//! - Claim leases: a job whose worker died is handed out again
//!
//! ## Components
//!
//! - `Job`: Core job abstraction with payload and metadata
//! - `JobQueue`: Durable queue (in-memory or Redis)
//! - `JobExecutor`: Worker pool applying handler results
//! - `DeadLetterEntry`: Failed jobs for inspection/replay

pub mod executor;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod types;

pub use executor::{Disposition, ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use queue::{DEFAULT_COMPLETED_RETENTION, InMemoryJobQueue, JobQueue, JobQueueError, JobStats};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobAttemptRecord, JobId, JobResult, JobStatus,
    PROCESS_ORDER_TASK, RetryPolicy,
};
