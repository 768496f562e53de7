//! Durable job queue abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// How long a completed job stays visible through `get` before it is dropped.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(3600);

/// Job queue abstraction.
///
/// Jobs move `Pending -> Running -> Completed`, or back into the queue as
/// `Retrying` after a transient failure, or out to the dead-letter list. A
/// claimed job carries a lease; `recover_expired` requeues running jobs whose
/// worker went away.
pub trait JobQueue: Send + Sync {
    /// Enqueue a new job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobQueueError>;

    /// Get a job by ID (active, or completed within the retention window; not
    /// dead-lettered).
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError>;

    /// Claim the oldest ready job and lease it for `lease`.
    fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobQueueError>;

    /// Persist a job the executor marked completed. Completed jobs are kept
    /// for a bounded retention window only.
    fn complete(&self, job: &Job) -> Result<(), JobQueueError>;

    /// Persist a job the executor marked retrying; it becomes claimable at
    /// its `scheduled_at`.
    fn reschedule(&self, job: &Job) -> Result<(), JobQueueError>;

    /// Move a job to the dead-letter queue.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobQueueError>;

    /// Dead-lettered jobs, oldest first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobQueueError>;

    /// Move a dead-lettered job back to the queue with a fresh retry budget.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobQueueError>;

    /// Requeue running jobs whose lease expired before `now`.
    fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize, JobQueueError>;

    fn stats(&self) -> Result<JobStats, JobQueueError>;
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobQueueError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        (**self).get(job_id)
    }

    fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobQueueError> {
        (**self).claim_next(lease)
    }

    fn complete(&self, job: &Job) -> Result<(), JobQueueError> {
        (**self).complete(job)
    }

    fn reschedule(&self, job: &Job) -> Result<(), JobQueueError> {
        (**self).reschedule(job)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobQueueError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobQueueError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        (**self).retry_dead_letter(job_id)
    }

    fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize, JobQueueError> {
        (**self).recover_expired(now)
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        (**self).stats()
    }
}

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobQueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Queue unreachable (transient).
    #[error("job queue unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobQueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobQueueError::Unavailable(_))
    }
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub dead_lettered: usize,
}

/// In-memory job queue for tests/dev.
///
/// `set_available(false)` makes every call fail with `JobQueueError::Unavailable`.
/// Completed jobs older than the retention window are pruned on `complete`.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    available: AtomicBool,
    completed_retention: Duration,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            completed_retention: DEFAULT_COMPLETED_RETENTION,
        }
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// All jobs for `task` (any status except dead-lettered), oldest first.
    pub fn jobs_for_task(&self, task: &str) -> Vec<Job> {
        let Ok(jobs) = self.jobs.read() else {
            return vec![];
        };
        let mut found: Vec<Job> = jobs.values().filter(|j| j.task == task).cloned().collect();
        found.sort_by_key(|j| (j.created_at, j.id));
        found
    }

    /// Make every delayed job claimable now (skips backoff in tests).
    pub fn expedite_all(&self) {
        if let Ok(mut jobs) = self.jobs.write() {
            for job in jobs.values_mut().filter(|j| j.status.is_queued()) {
                job.scheduled_at = None;
            }
        }
    }

    fn check_available(&self) -> Result<(), JobQueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobQueueError::Unavailable("in-memory job queue offline".to_string()))
        }
    }

    fn replace(&self, job: &Job) -> Result<(), JobQueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobQueueError::NotFound(job.id)),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> JobQueueError {
    JobQueueError::Storage("job queue lock poisoned".to_string())
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: Job) -> Result<JobId, JobQueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobQueueError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.check_available()?;
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobQueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let now = Utc::now();

        // Oldest ready job first.
        let next = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.ready_at(), j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running(now, lease);
                job.clone()
            })
        }))
    }

    fn complete(&self, job: &Job) -> Result<(), JobQueueError> {
        self.replace(job)?;

        let Some(cutoff) = chrono::Duration::from_std(self.completed_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(());
        };
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.retain(|_, j| !(matches!(j.status, JobStatus::Completed) && j.updated_at < cutoff));
        Ok(())
    }

    fn reschedule(&self, job: &Job) -> Result<(), JobQueueError> {
        self.replace(job)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobQueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut dls = self.dead_letters.write().map_err(|_| poisoned())?;

        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                reason: reason.clone(),
                attempts: job.history.len() as u32,
            };
            job.updated_at = Utc::now();
        }

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobQueueError> {
        self.check_available()?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = dls.values().cloned().collect();

        result.sort_by_key(|e| (e.dead_lettered_at, e.job.id));
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut dls = self.dead_letters.write().map_err(|_| poisoned())?;

        let entry = dls.remove(&job_id).ok_or(JobQueueError::NotFound(job_id))?;

        let mut job = entry.job;
        job.reset_for_replay();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize, JobQueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;

        let mut recovered = 0;
        for job in jobs.values_mut().filter(|j| j.lease_expired(now)) {
            job.release_lease(now);
            recovered += 1;
        }
        Ok(recovered)
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        self.check_available()?;
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;

        let mut stats = JobStats {
            dead_lettered: dls.len(),
            ..JobStats::default()
        };

        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying { .. } => stats.retrying += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::RetryPolicy;

    const LEASE: Duration = Duration::from_secs(30);

    #[test]
    fn enqueue_and_claim() {
        let queue = InMemoryJobQueue::new();

        let job = Job::new("test", serde_json::json!({}));
        let job_id = queue.enqueue(job).unwrap();

        let claimed = queue.claim_next(LEASE).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert!(claimed.lease_expires_at.is_some());

        // No more jobs
        assert!(queue.claim_next(LEASE).unwrap().is_none());
    }

    #[test]
    fn claims_in_fifo_order() {
        let queue = InMemoryJobQueue::new();
        let first = queue.enqueue(Job::new("test", serde_json::json!({"n": 1}))).unwrap();
        let second = queue.enqueue(Job::new("test", serde_json::json!({"n": 2}))).unwrap();

        assert_eq!(queue.claim_next(LEASE).unwrap().unwrap().id, first);
        assert_eq!(queue.claim_next(LEASE).unwrap().unwrap().id, second);
    }

    #[test]
    fn rescheduled_job_waits_for_backoff() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(Job::new("test", serde_json::json!({}))).unwrap();

        let mut claimed = queue.claim_next(LEASE).unwrap().unwrap();
        claimed.mark_retrying("boom".to_string(), Duration::from_secs(60), Utc::now());
        queue.reschedule(&claimed).unwrap();

        assert!(queue.claim_next(LEASE).unwrap().is_none());
        assert_eq!(queue.stats().unwrap().retrying, 1);

        queue.expedite_all();
        let again = queue.claim_next(LEASE).unwrap().unwrap();
        assert_eq!(again.attempt_count, 1);
    }

    #[test]
    fn dead_letter_flow() {
        let queue = InMemoryJobQueue::new();

        let job = Job::new("test", serde_json::json!({})).with_retry_policy(RetryPolicy::no_retry());
        let job_id = job.id;
        queue.enqueue(job).unwrap();

        let mut claimed = queue.claim_next(LEASE).unwrap().unwrap();
        claimed.mark_dead_lettered("order not found".to_string(), Utc::now());
        queue.dead_letter(claimed, "order not found".to_string()).unwrap();

        // Job is no longer in main queue
        assert!(queue.get(job_id).unwrap().is_none());

        // Job is in DLQ
        let dls = queue.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job.id, job_id);
        assert_eq!(dls[0].reason, "order not found");

        // Replay the job
        let retried = queue.retry_dead_letter(job_id).unwrap();
        assert!(matches!(retried.status, JobStatus::Pending));
        assert_eq!(retried.attempt_count, 0);

        // DLQ is now empty
        assert!(queue.list_dead_letters(10).unwrap().is_empty());
        assert!(queue.claim_next(LEASE).unwrap().is_some());
    }

    #[test]
    fn retry_unknown_dead_letter_is_not_found() {
        let queue = InMemoryJobQueue::new();
        let id = JobId::new();
        assert_eq!(queue.retry_dead_letter(id), Err(JobQueueError::NotFound(id)));
    }

    #[test]
    fn expired_lease_is_recovered() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(Job::new("test", serde_json::json!({}))).unwrap();
        queue.claim_next(Duration::ZERO).unwrap().unwrap();

        assert_eq!(queue.recover_expired(Utc::now()).unwrap(), 1);

        let reclaimed = queue.claim_next(LEASE).unwrap().unwrap();
        assert_eq!(reclaimed.id, job_id);
        assert_eq!(queue.recover_expired(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn stats_tracking() {
        let queue = InMemoryJobQueue::new();

        for i in 0..5 {
            queue.enqueue(Job::new("test", serde_json::json!({"i": i}))).unwrap();
        }

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 5);

        queue.claim_next(LEASE).unwrap();
        queue.claim_next(LEASE).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
    }

    #[test]
    fn completed_jobs_are_dropped_after_retention() {
        let queue = InMemoryJobQueue::new().with_completed_retention(Duration::from_secs(600));
        let old_id = queue.enqueue(Job::new("test", serde_json::json!({"n": 1}))).unwrap();
        let recent_id = queue.enqueue(Job::new("test", serde_json::json!({"n": 2}))).unwrap();

        let mut old = queue.claim_next(LEASE).unwrap().unwrap();
        let mut recent = queue.claim_next(LEASE).unwrap().unwrap();
        assert_eq!((old.id, recent.id), (old_id, recent_id));

        recent.mark_completed(Utc::now());
        queue.complete(&recent).unwrap();
        assert!(matches!(queue.get(recent_id).unwrap().unwrap().status, JobStatus::Completed));

        old.mark_completed(Utc::now());
        old.updated_at = Utc::now() - chrono::Duration::hours(1);
        queue.complete(&old).unwrap();

        assert!(queue.get(old_id).unwrap().is_none());
        assert!(queue.get(recent_id).unwrap().is_some());
        assert_eq!(queue.stats().unwrap().completed, 1);
    }

    #[test]
    fn offline_queue_rejects_enqueue() {
        let queue = InMemoryJobQueue::new();
        queue.set_available(false);

        let err = queue.enqueue(Job::new("test", serde_json::json!({}))).unwrap_err();
        assert!(err.is_transient());
    }
}
