//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task name of the order fulfillment job.
pub const PROCESS_ORDER_TASK: &str = "process_order";

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by a worker (lease held)
    Running,
    /// Failed transiently, waiting for its backoff to elapse
    Retrying { error: String, attempt_count: u32 },
    Completed,
    /// Permanently failed or out of retries
    DeadLettered { reason: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    /// Waiting in the ready set (possibly delayed).
    pub fn is_queued(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// base * 2^attempt_count
    #[default]
    Exponential,
}

/// Retry policy configuration.
///
/// Retries are bounded by attempt count: a job whose `attempt_count` (failures
/// so far) has reached `max_attempts` is not retried again. With
/// `max_attempts = 3` the schedule is `base*1, base*2, base*4` and the fourth
/// failure is permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = no retries)
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap applied to every computed delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows `attempt_count` earlier failures.
    pub fn delay_for_retry(&self, attempt_count: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// `Some(delay)` if a failure at `attempt_count` may be retried.
    pub fn next_delay(&self, attempt_count: u32) -> Option<Duration> {
        self.should_retry(attempt_count)
            .then(|| self.delay_for_retry(attempt_count))
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Task name used to route the job to its handler
    pub task: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Failed attempts so far (starts at 0)
    pub attempt_count: u32,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant (backoff / delayed jobs)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Claim lease; a running job past it is handed out again
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    /// 1-based
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// `at + d`, saturating at the far future.
pub(crate) fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Job {
    pub fn new(task: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            task: task.into(),
            payload,
            status: JobStatus::Pending,
            attempt_count: 0,
            retry_policy: RetryPolicy::default(),
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            lease_expires_at: None,
            history: Vec::new(),
        }
    }

    /// Fulfillment job for `order_id` (`{"order_id": "..."}`).
    pub fn process_order(order_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self::new(
            PROCESS_ORDER_TASK,
            serde_json::json!({ "order_id": order_id.into() }),
        )
        .with_retry_policy(policy)
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(after(Utc::now(), delay));
        self
    }

    /// `order_id` field of the payload, if present and a string.
    pub fn order_id(&self) -> Option<&str> {
        self.payload.get("order_id").and_then(|v| v.as_str())
    }

    /// Earliest instant the job may be claimed.
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_queued() && self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Running)
            && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Mark job as claimed until `now + lease`.
    pub fn mark_running(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.status = JobStatus::Running;
        self.lease_expires_at = Some(after(now, lease));
        self.updated_at = now;
    }

    /// Put a running job whose lease lapsed back in the queue.
    pub fn release_lease(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.lease_expires_at = None;
        self.scheduled_at = None;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.record_attempt(started_at, now, None);
        self.status = JobStatus::Completed;
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Record a transient failure and schedule the next attempt after `delay`.
    pub fn mark_retrying(&mut self, error: String, delay: Duration, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.record_attempt(started_at, now, Some(error.clone()));
        self.attempt_count += 1;
        self.scheduled_at = Some(after(now, delay));
        self.lease_expires_at = None;
        self.status = JobStatus::Retrying {
            error,
            attempt_count: self.attempt_count,
        };
        self.updated_at = now;
    }

    pub fn mark_dead_lettered(&mut self, reason: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.record_attempt(started_at, now, Some(reason.clone()));
        self.status = JobStatus::DeadLettered {
            reason,
            attempts: self.history.len() as u32,
        };
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Reset a dead-lettered job for operator replay.
    pub fn reset_for_replay(&mut self) {
        self.status = JobStatus::Pending;
        self.attempt_count = 0;
        self.scheduled_at = None;
        self.lease_expires_at = None;
        self.updated_at = Utc::now();
    }

    fn record_attempt(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) {
        self.history.push(JobAttemptRecord {
            attempt: self.history.len() as u32 + 1,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Result of a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Transient failure; try again after `delay`
    RetryAfter { delay: Duration, error: String },
    /// Permanent failure; dead-letter without retrying
    Failure(String),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
