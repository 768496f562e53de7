//! Redis-backed job queue.
//!
//! ## Keys (prefix `orderflow:jobs` by default)
//!
//! - `{prefix}:data`: hash `job_id -> Job` JSON (active jobs only)
//! - `{prefix}:ready`: sorted set of claimable ids scored by ready time (ms)
//! - `{prefix}:running`: sorted set of claimed ids scored by lease expiry (ms)
//! - `{prefix}:dlq`: hash `job_id -> DeadLetterEntry` JSON
//! - `{prefix}:done:{job_id}`: completed `Job` JSON, expiring after the
//!   completed-job retention
//! - `{prefix}:completed`: sorted set of completed ids scored by completion
//!   time (ms), trimmed to the retention window
//!
//! Enqueueing, claiming and completing each run as one Lua script, so a job is
//! never indexed without data (or left behind in `data` once completed) and
//! two workers can never claim the same job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use super::queue::{DEFAULT_COMPLETED_RETENTION, JobQueue, JobQueueError, JobStats};
use super::types::{DeadLetterEntry, Job, JobId, JobStatus, after};

const DEFAULT_PREFIX: &str = "orderflow:jobs";

/// One hundred years.
const MAX_RETENTION_MS: u64 = 100 * 365 * 24 * 3600 * 1000;

/// KEYS: data, ready, done. ARGV: id, job_json, ready_ms. Returns 0 on a duplicate id.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
    return 0
end
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// KEYS: data, ready, running, completed, done.
/// ARGV: id, job_json, now_ms, retention_ms.
const COMPLETE_SCRIPT: &str = r#"
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('SET', KEYS[5], ARGV[2], 'PX', ARGV[4])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[4], '-inf', tonumber(ARGV[3]) - tonumber(ARGV[4]))
return 1
"#;

/// KEYS: ready, running, data. ARGV: now_ms, lease_expiry_ms.
const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], ARGV[2], id)
return {id, redis.call('HGET', KEYS[3], id) or ''}
"#;

/// KEYS: running, ready. ARGV: now_ms. Returns the ids moved back to ready.
const RECOVER_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return ids
"#;

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    data_key: String,
    ready_key: String,
    running_key: String,
    dlq_key: String,
    completed_key: String,
    done_prefix: String,
    completed_retention: Duration,
}

impl RedisJobQueue {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, JobQueueError> {
        Self::with_prefix(redis_url, DEFAULT_PREFIX)
    }

    pub fn with_prefix(
        redis_url: impl AsRef<str>,
        prefix: impl AsRef<str>,
    ) -> Result<Self, JobQueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| JobQueueError::Unavailable(e.to_string()))?;
        let prefix = prefix.as_ref();

        Ok(Self {
            client: Arc::new(client),
            data_key: format!("{prefix}:data"),
            ready_key: format!("{prefix}:ready"),
            running_key: format!("{prefix}:running"),
            dlq_key: format!("{prefix}:dlq"),
            completed_key: format!("{prefix}:completed"),
            done_prefix: format!("{prefix}:done:"),
            completed_retention: DEFAULT_COMPLETED_RETENTION,
        })
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    fn done_key(&self, id: JobId) -> String {
        format!("{}{}", self.done_prefix, id)
    }

    /// `PX` rejects zero and values past the clock's range.
    fn retention_ms(&self) -> u64 {
        u64::try_from(self.completed_retention.as_millis())
            .unwrap_or(u64::MAX)
            .clamp(1, MAX_RETENTION_MS)
    }

    fn connection(&self) -> Result<redis::Connection, JobQueueError> {
        self.client
            .get_connection()
            .map_err(|e| JobQueueError::Unavailable(e.to_string()))
    }

    fn load(&self, conn: &mut redis::Connection, id: JobId) -> Result<Option<Job>, JobQueueError> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.data_key)
            .arg(id.to_string())
            .query(conn)
            .map_err(command_error("HGET"))?;
        raw.as_deref().map(decode).transpose()
    }

    /// Store `job` and move it to the `target` sorted set.
    fn store(
        &self,
        conn: &mut redis::Connection,
        job: &Job,
        target: (&str, i64),
    ) -> Result<(), JobQueueError> {
        let id = job.id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&self.data_key)
            .arg(&id)
            .arg(encode(job)?)
            .ignore()
            .cmd("ZREM")
            .arg(&self.ready_key)
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(&self.running_key)
            .arg(&id)
            .ignore();
        let (key, score) = target;
        pipe.cmd("ZADD").arg(key).arg(score).arg(&id).ignore();

        pipe.query::<()>(conn).map_err(command_error("MULTI"))
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, JobQueueError> {
    serde_json::to_string(value).map_err(|e| JobQueueError::Storage(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, JobQueueError> {
    serde_json::from_str(raw).map_err(|e| JobQueueError::Storage(e.to_string()))
}

fn command_error(command: &'static str) -> impl Fn(redis::RedisError) -> JobQueueError {
    move |e| {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
        {
            JobQueueError::Unavailable(format!("{} failed: {}", command, e))
        } else {
            JobQueueError::Storage(format!("{} failed: {}", command, e))
        }
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.id, task = %job.task), err)]
    fn enqueue(&self, job: Job) -> Result<JobId, JobQueueError> {
        let mut conn = self.connection()?;
        let id = job.id;

        let inserted: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(&self.data_key)
            .key(&self.ready_key)
            .key(self.done_key(id))
            .arg(id.to_string())
            .arg(encode(&job)?)
            .arg(millis(job.ready_at()))
            .invoke(&mut conn)
            .map_err(command_error("EVALSHA enqueue"))?;
        if inserted == 0 {
            return Err(JobQueueError::AlreadyExists(id));
        }
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        let mut conn = self.connection()?;
        if let Some(job) = self.load(&mut conn, job_id)? {
            return Ok(Some(job));
        }

        let raw: Option<String> = redis::cmd("GET")
            .arg(self.done_key(job_id))
            .query(&mut conn)
            .map_err(command_error("GET"))?;
        raw.as_deref().map(decode).transpose()
    }

    #[instrument(skip(self), err)]
    fn claim_next(&self, lease: Duration) -> Result<Option<Job>, JobQueueError> {
        let mut conn = self.connection()?;
        let now = Utc::now();

        let claimed: Option<(String, String)> = redis::Script::new(CLAIM_SCRIPT)
            .key(&self.ready_key)
            .key(&self.running_key)
            .key(&self.data_key)
            .arg(millis(now))
            .arg(millis(after(now, lease)))
            .invoke(&mut conn)
            .map_err(command_error("EVALSHA claim"))?;

        let Some((id, raw)) = claimed else {
            return Ok(None);
        };
        if raw.is_empty() {
            // Index entry without data: drop it.
            let _: () = redis::cmd("ZREM")
                .arg(&self.running_key)
                .arg(&id)
                .query(&mut conn)
                .map_err(command_error("ZREM"))?;
            return Err(JobQueueError::Storage(format!("job {id} has no data")));
        }

        let mut job: Job = decode(&raw)?;
        job.mark_running(now, lease);
        let _: () = redis::cmd("HSET")
            .arg(&self.data_key)
            .arg(&id)
            .arg(encode(&job)?)
            .query(&mut conn)
            .map_err(command_error("HSET"))?;
        Ok(Some(job))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn complete(&self, job: &Job) -> Result<(), JobQueueError> {
        let mut conn = self.connection()?;

        let _: i64 = redis::Script::new(COMPLETE_SCRIPT)
            .key(&self.data_key)
            .key(&self.ready_key)
            .key(&self.running_key)
            .key(&self.completed_key)
            .key(self.done_key(job.id))
            .arg(job.id.to_string())
            .arg(encode(job)?)
            .arg(millis(Utc::now()))
            .arg(self.retention_ms())
            .invoke(&mut conn)
            .map_err(command_error("EVALSHA complete"))?;
        Ok(())
    }

    fn reschedule(&self, job: &Job) -> Result<(), JobQueueError> {
        let mut conn = self.connection()?;
        self.store(&mut conn, job, (&self.ready_key, millis(job.ready_at())))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobQueueError> {
        let mut conn = self.connection()?;
        let id = job.id.to_string();

        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                reason: reason.clone(),
                attempts: job.history.len() as u32,
            };
            job.updated_at = Utc::now();
        }
        let entry = DeadLetterEntry::new(job, reason);

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&self.dlq_key)
            .arg(&id)
            .arg(encode(&entry)?)
            .ignore()
            .cmd("HDEL")
            .arg(&self.data_key)
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(&self.ready_key)
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(&self.running_key)
            .arg(&id)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(command_error("MULTI"))
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobQueueError> {
        let mut conn = self.connection()?;
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(&self.dlq_key)
            .query(&mut conn)
            .map_err(command_error("HVALS"))?;

        let mut entries = raw
            .iter()
            .map(|r| decode::<DeadLetterEntry>(r))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| (e.dead_lettered_at, e.job.id));
        entries.truncate(limit);
        Ok(entries)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        let mut conn = self.connection()?;
        let id = job_id.to_string();

        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.dlq_key)
            .arg(&id)
            .query(&mut conn)
            .map_err(command_error("HGET"))?;
        let entry: DeadLetterEntry = decode(&raw.ok_or(JobQueueError::NotFound(job_id))?)?;

        let mut job = entry.job;
        job.reset_for_replay();

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&self.data_key)
            .arg(&id)
            .arg(encode(&job)?)
            .ignore()
            .cmd("ZADD")
            .arg(&self.ready_key)
            .arg(millis(Utc::now()))
            .arg(&id)
            .ignore()
            .cmd("HDEL")
            .arg(&self.dlq_key)
            .arg(&id)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(command_error("MULTI"))?;
        Ok(job)
    }

    fn recover_expired(&self, now: DateTime<Utc>) -> Result<usize, JobQueueError> {
        let mut conn = self.connection()?;

        let ids: Vec<String> = redis::Script::new(RECOVER_SCRIPT)
            .key(&self.running_key)
            .key(&self.ready_key)
            .arg(millis(now))
            .invoke(&mut conn)
            .map_err(command_error("EVALSHA recover"))?;

        for id in &ids {
            let Ok(job_id) = id.parse::<JobId>() else {
                continue;
            };
            if let Some(mut job) = self.load(&mut conn, job_id)? {
                job.release_lease(now);
                let _: () = redis::cmd("HSET")
                    .arg(&self.data_key)
                    .arg(id)
                    .arg(encode(&job)?)
                    .query(&mut conn)
                    .map_err(command_error("HSET"))?;
            }
        }
        Ok(ids.len())
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        let mut conn = self.connection()?;
        let now = millis(Utc::now());

        let retained_since = now - self.retention_ms() as i64;
        let (pending, retrying, running, dead_lettered, completed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .cmd("ZCOUNT")
                .arg(&self.ready_key)
                .arg("-inf")
                .arg(now)
                .cmd("ZCOUNT")
                .arg(&self.ready_key)
                .arg(format!("({now}"))
                .arg("+inf")
                .cmd("ZCARD")
                .arg(&self.running_key)
                .cmd("HLEN")
                .arg(&self.dlq_key)
                .cmd("ZCOUNT")
                .arg(&self.completed_key)
                .arg(retained_since)
                .arg("+inf")
                .query(&mut conn)
                .map_err(command_error("stats"))?;

        // Delayed entries in the ready set are backoff retries (or delayed jobs).
        Ok(JobStats {
            pending,
            running,
            retrying,
            completed,
            dead_lettered,
        })
    }
}
