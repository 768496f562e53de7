//! Pipeline configuration from environment variables.

use std::time::Duration;

use orderflow_events::NEW_ORDER_TOPIC;

use crate::cache::DEFAULT_ORDER_TTL;
use crate::consumer::{DEFAULT_CONSUMER_GROUP, generate_consumer_name};
use crate::jobs::RetryPolicy;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Upper bound for `ORDER_CACHE_TTL_SECS` (30 days).
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Postgres + Redis when true, in-memory collaborators otherwise.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub topic: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub cache_ttl: Duration,
    pub worker_concurrency: usize,
    pub job_retry_policy: RetryPolicy,
    pub job_lease: Duration,
    pub payment_timeout: Duration,
    pub payment_processing: Duration,
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            topic: NEW_ORDER_TOPIC.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: generate_consumer_name(),
            cache_ttl: DEFAULT_ORDER_TTL,
            worker_concurrency: 4,
            job_retry_policy: RetryPolicy::default(),
            job_lease: Duration::from_secs(60),
            payment_timeout: Duration::from_millis(5000),
            payment_processing: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(v) => parse_bool("USE_PERSISTENT_STORES", &v)?,
            None => defaults.use_persistent_stores,
        };

        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let worker_concurrency: usize =
            parse_or("WORKER_CONCURRENCY", get("WORKER_CONCURRENCY"), defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }

        let base_ms = parse_or("JOB_BACKOFF_BASE_MS", get("JOB_BACKOFF_BASE_MS"), 1000u64)?;
        let max_ms = parse_or("JOB_BACKOFF_MAX_MS", get("JOB_BACKOFF_MAX_MS"), 60_000u64)?;
        if max_ms < base_ms {
            return Err(invalid(
                "JOB_BACKOFF_MAX_MS",
                &max_ms.to_string(),
                "must not be below JOB_BACKOFF_BASE_MS",
            ));
        }
        let cache_ttl = secs("ORDER_CACHE_TTL_SECS", get("ORDER_CACHE_TTL_SECS"), defaults.cache_ttl)?;
        if cache_ttl > MAX_CACHE_TTL {
            return Err(invalid(
                "ORDER_CACHE_TTL_SECS",
                &cache_ttl.as_secs().to_string(),
                format!("must not exceed {}", MAX_CACHE_TTL.as_secs()),
            ));
        }

        let job_retry_policy = RetryPolicy::exponential(
            parse_or("JOB_MAX_ATTEMPTS", get("JOB_MAX_ATTEMPTS"), 3u32)?,
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
        );

        Ok(Self {
            use_persistent_stores,
            database_url,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            topic: get("FULFILLMENT_TOPIC").unwrap_or(defaults.topic),
            consumer_group: get("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            consumer_name: get("CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            cache_ttl,
            worker_concurrency,
            job_retry_policy,
            job_lease: secs("JOB_LEASE_SECS", get("JOB_LEASE_SECS"), defaults.job_lease)?,
            payment_timeout: millis("PAYMENT_TIMEOUT_MS", get("PAYMENT_TIMEOUT_MS"), defaults.payment_timeout)?,
            payment_processing: millis(
                "PAYMENT_PROCESSING_MS",
                get("PAYMENT_PROCESSING_MS"),
                defaults.payment_processing,
            )?,
            poll_interval: millis("POLL_INTERVAL_MS", get("POLL_INTERVAL_MS"), defaults.poll_interval)?,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value, "expected true or false")),
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => v.trim().parse().map_err(|e: T::Err| invalid(key, &v, e.to_string())),
        None => Ok(default),
    }
}

fn secs(key: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(key, value, default.as_secs()).map(Duration::from_secs)
}

fn millis(key: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    parse_or(key, value, default.as_millis() as u64).map(Duration::from_millis)
}
