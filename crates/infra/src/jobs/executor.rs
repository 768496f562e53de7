//! Job executor: a bounded worker pool with retry and dead-letter handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::queue::{JobQueue, JobQueueError};
use super::types::{Job, JobResult};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Number of worker threads
    pub max_concurrent: usize,
    /// Claim lease; a job held longer is handed to another worker
    pub lease: Duration,
    /// Name for logging and thread names
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent: 4,
            lease: Duration::from_secs(60),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// What happened to a job after one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Rescheduled { delay: Duration },
    DeadLettered { reason: String },
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers {
            let _ = worker.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Background job executor.
///
/// Claims jobs from a queue, runs the handler registered for the job's task,
/// and applies the result: complete, reschedule with backoff, or dead-letter.
pub struct JobExecutor {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<String, JobHandler>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("tasks", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    /// Create a new executor with the given queue.
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a task name.
    pub fn register_handler<F>(&mut self, task: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(task.into(), Box::new(handler));
    }

    /// Spawn `max_concurrent` worker threads.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let executor = Arc::new(self);
        let started = Instant::now();

        let mut workers = Vec::with_capacity(config.max_concurrent.max(1));
        for index in 0..config.max_concurrent.max(1) {
            let executor = executor.clone();
            let config = config.clone();
            let shutdown_flag = shutdown.clone();
            let stats = stats.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, index))
                .spawn(move || worker_loop(&executor, &config, &shutdown_flag, &stats, started));

            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // Stop the workers already running before reporting.
                    shutdown.store(true, Ordering::SeqCst);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(executor = %config.name, workers = workers.len(), "job executor started");

        Ok(JobExecutorHandle {
            shutdown,
            workers,
            stats,
        })
    }

    /// Execute a claimed job and record the result in the queue.
    pub fn execute_one(&self, job: &mut Job) -> Result<Disposition, JobQueueError> {
        let started = Utc::now();

        let result = match self.handlers.get(&job.task) {
            Some(handler) => handler(job),
            None => JobResult::Failure(format!("no handler for task: {}", job.task)),
        };

        match result {
            JobResult::Success => {
                job.mark_completed(started);
                self.queue.complete(job)?;
                debug!(job_id = %job.id, task = %job.task, "job completed");
                Ok(Disposition::Completed)
            }
            JobResult::RetryAfter { delay, error } => {
                if !job.retry_policy.should_retry(job.attempt_count) {
                    let reason = format!(
                        "retries exhausted after {} attempts: {}",
                        job.attempt_count + 1,
                        error
                    );
                    return self.dead_letter(job, reason, started);
                }

                job.mark_retrying(error.clone(), delay, started);
                self.queue.reschedule(job)?;
                warn!(
                    job_id = %job.id,
                    task = %job.task,
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job failed; retry scheduled"
                );
                Ok(Disposition::Rescheduled { delay })
            }
            JobResult::Failure(reason) => self.dead_letter(job, reason, started),
        }
    }

    fn dead_letter(
        &self,
        job: &mut Job,
        reason: String,
        started: chrono::DateTime<Utc>,
    ) -> Result<Disposition, JobQueueError> {
        job.mark_dead_lettered(reason.clone(), started);
        self.queue.dead_letter(job.clone(), reason.clone())?;
        error!(
            job_id = %job.id,
            task = %job.task,
            payload = %job.payload,
            reason = %reason,
            "job dead-lettered"
        );
        Ok(Disposition::DeadLettered { reason })
    }
}

fn worker_loop(
    executor: &JobExecutor,
    config: &JobExecutorConfig,
    shutdown: &AtomicBool,
    stats: &Mutex<ExecutorStats>,
    started: Instant,
) {
    debug!(executor = %config.name, "worker started");

    while !shutdown.load(Ordering::SeqCst) {
        update_stats(stats, |s| s.uptime_secs = started.elapsed().as_secs());

        match executor.queue.claim_next(config.lease) {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, job_id = %job.id, task = %job.task, "claimed job");
                update_stats(stats, |s| s.current_running += 1);

                let result = executor.execute_one(&mut job);

                update_stats(stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match &result {
                        Ok(Disposition::Completed) => s.jobs_succeeded += 1,
                        Ok(Disposition::Rescheduled { .. }) => s.jobs_retried += 1,
                        Ok(Disposition::DeadLettered { .. }) => s.jobs_dead_lettered += 1,
                        Err(_) => {}
                    }
                });

                if let Err(e) = result {
                    // The lease lapses and the job is handed out again.
                    error!(executor = %config.name, job_id = %job.id, error = %e, "failed to record job result");
                }
            }
            Ok(None) => {
                match executor.queue.recover_expired(Utc::now()) {
                    Ok(0) => {}
                    Ok(n) => warn!(executor = %config.name, recovered = n, "requeued jobs with expired leases"),
                    Err(e) => debug!(executor = %config.name, error = %e, "lease recovery failed"),
                }
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    debug!(executor = %config.name, "worker stopped");
}

fn update_stats(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::types::{JobStatus, RetryPolicy};
    use std::sync::atomic::AtomicU32;

    const LEASE: Duration = Duration::from_secs(30);

    #[test]
    fn execute_successful_job() {
        let queue = InMemoryJobQueue::arc();
        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("test", |_job| JobResult::Success);

        queue.enqueue(Job::new("test", serde_json::json!({}))).unwrap();

        let mut claimed = queue.claim_next(LEASE).unwrap().unwrap();
        assert_eq!(executor.execute_one(&mut claimed).unwrap(), Disposition::Completed);

        let stored = queue.get(claimed.id).unwrap().unwrap();
        assert!(matches!(stored.status, JobStatus::Completed));
    }

    #[test]
    fn retry_then_dead_letter_when_budget_spent() {
        let queue = InMemoryJobQueue::arc();
        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("test", |_job| JobResult::RetryAfter {
            delay: Duration::from_millis(10),
            error: "transient".to_string(),
        });

        let job = Job::new("test", serde_json::json!({}))
            .with_retry_policy(RetryPolicy::fixed(1, Duration::from_millis(10)));
        queue.enqueue(job).unwrap();

        let mut claimed = queue.claim_next(LEASE).unwrap().unwrap();
        assert!(matches!(
            executor.execute_one(&mut claimed).unwrap(),
            Disposition::Rescheduled { .. }
        ));

        queue.expedite_all();
        let mut claimed = queue.claim_next(LEASE).unwrap().unwrap();
        assert!(matches!(
            executor.execute_one(&mut claimed).unwrap(),
            Disposition::DeadLettered { .. }
        ));
        assert_eq!(queue.list_dead_letters(10).unwrap().len(), 1);
    }

    #[test]
    fn permanent_failure_is_dead_lettered_immediately() {
        let queue = InMemoryJobQueue::arc();
        let mut executor = JobExecutor::new(queue.clone());
        executor.register_handler("test", |_job| JobResult::Failure("bad payload".to_string()));

        queue.enqueue(Job::new("test", serde_json::json!({}))).unwrap();
        let mut claimed = queue.claim_next(LEASE).unwrap().unwrap();

        assert_eq!(
            executor.execute_one(&mut claimed).unwrap(),
            Disposition::DeadLettered {
                reason: "bad payload".to_string()
            }
        );
        let dls = queue.list_dead_letters(10).unwrap();
        assert_eq!(dls[0].job.history.len(), 1);
    }

    #[test]
    fn unknown_task_is_dead_lettered() {
        let queue = InMemoryJobQueue::arc();
        let executor = JobExecutor::new(queue.clone());

        queue.enqueue(Job::new("mystery", serde_json::json!({}))).unwrap();
        let mut claimed = queue.claim_next(LEASE).unwrap().unwrap();

        assert!(matches!(
            executor.execute_one(&mut claimed).unwrap(),
            Disposition::DeadLettered { .. }
        ));
    }

    #[test]
    fn spawned_pool_drains_queue_and_shuts_down() {
        let queue = InMemoryJobQueue::arc();
        let runs = Arc::new(AtomicU32::new(0));
        let mut executor = JobExecutor::new(queue.clone());
        let counter = runs.clone();
        executor.register_handler("test", move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });

        for i in 0..10 {
            queue.enqueue(Job::new("test", serde_json::json!({"i": i}))).unwrap();
        }

        let handle = executor
            .spawn(
                JobExecutorConfig::default()
                    .with_max_concurrent(3)
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_succeeded < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(handle.stats().jobs_succeeded, 10);
        assert_eq!(queue.stats().unwrap().completed, 10);
        handle.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 10);
    }
}
