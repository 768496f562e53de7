//! Event consumer: turns `new_order` deliveries into `process_order` jobs.
//!
//! ```text
//! poll → decode → enqueue job → commit
//!          │            │
//!          │            └─ enqueue failed: backoff, retry the same delivery
//!          └─ malformed: warn, commit (never requeued)
//! ```
//!
//! A delivery is committed only once its job is durably enqueued (or it was
//! skipped as malformed). Losing the broker is fatal for the consumer thread;
//! the handle reports it so the process can exit and be restarted.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use orderflow_events::{
    Broker, BrokerError, BrokerSubscription, Delivery, EventDecodeError, FulfillmentEvent,
    NEW_ORDER_TOPIC,
};

use crate::jobs::{Job, JobId, JobQueue, JobQueueError, RetryPolicy};

pub const DEFAULT_CONSUMER_GROUP: &str = "order_consumer_group";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group: String,
    /// Unique per process within the group.
    pub consumer_name: String,
    pub poll_timeout: Duration,
    /// Delays between enqueue attempts for one delivery (only the delay
    /// schedule is used; submission retries until it succeeds or shutdown).
    pub submit_backoff: RetryPolicy,
    /// Retry policy stamped on every job the consumer submits.
    pub job_retry_policy: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: NEW_ORDER_TOPIC.to_string(),
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: generate_consumer_name(),
            poll_timeout: Duration::from_millis(500),
            submit_backoff: RetryPolicy::exponential(
                u32::MAX,
                Duration::from_millis(100),
                Duration::from_secs(5),
            ),
            job_retry_policy: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_submit_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.submit_backoff = backoff;
        self
    }

    pub fn with_job_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.job_retry_policy = policy;
        self
    }
}

pub fn generate_consumer_name() -> String {
    format!("orderflow-consumer-{}", Uuid::now_v7())
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Submitted(JobId),
    /// Malformed payload; safe to commit.
    Skipped(EventDecodeError),
    /// Enqueue failed; the delivery must not be committed.
    SubmitFailed(JobQueueError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    #[error("failed to subscribe to {topic} as group {group}: {source}")]
    Subscribe {
        topic: String,
        group: String,
        #[source]
        source: BrokerError,
    },

    #[error("broker lost: {0}")]
    BrokerLost(#[source] BrokerError),

    #[error("failed to start consumer thread: {0}")]
    Spawn(String),

    #[error("consumer thread panicked")]
    Panicked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub submitted: u64,
    pub skipped: u64,
    pub submit_retries: u64,
    pub redeliveries: u64,
}

#[derive(Clone)]
pub struct FulfillmentConsumer {
    queue: Arc<dyn JobQueue>,
    config: ConsumerConfig,
}

impl std::fmt::Debug for FulfillmentConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FulfillmentConsumer {
    pub fn new(queue: Arc<dyn JobQueue>, config: ConsumerConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Decode one delivery and submit its job. Does not commit.
    pub fn handle_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        let event = match FulfillmentEvent::from_bytes(&delivery.payload) {
            Ok(event) => event,
            Err(e) => return DeliveryOutcome::Skipped(e),
        };

        let job = Job::process_order(event.order_id, self.config.job_retry_policy.clone());
        match self.queue.enqueue(job) {
            Ok(job_id) => DeliveryOutcome::Submitted(job_id),
            Err(e) => DeliveryOutcome::SubmitFailed(e),
        }
    }

    /// Join the consumer group, then start the consumer thread.
    ///
    /// Subscribing happens on the caller's thread so a broker that cannot be
    /// reached fails startup instead of the background thread.
    pub fn spawn(self, broker: &dyn Broker) -> Result<ConsumerHandle, ConsumerError> {
        let subscription = broker
            .subscribe(
                &self.config.topic,
                &self.config.group,
                &self.config.consumer_name,
            )
            .map_err(|source| ConsumerError::Subscribe {
                topic: self.config.topic.clone(),
                group: self.config.group.clone(),
                source,
            })?;

        info!(
            topic = %self.config.topic,
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            "fulfillment consumer subscribed"
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let thread_stats = stats.clone();

        let join = thread::Builder::new()
            .name("fulfillment-consumer".to_string())
            .spawn(move || self.consume_loop(subscription, &shutdown_rx, &thread_stats))
            .map_err(|e| ConsumerError::Spawn(e.to_string()))?;

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn consume_loop(
        &self,
        mut subscription: Box<dyn BrokerSubscription>,
        shutdown_rx: &mpsc::Receiver<()>,
        stats: &Mutex<ConsumerStats>,
    ) -> Result<(), ConsumerError> {
        loop {
            if shutdown_requested(shutdown_rx) {
                break;
            }

            let delivery = match subscription.poll(self.config.poll_timeout) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(topic = %self.config.topic, group = %self.config.group, error = %e, "consumer lost the broker");
                    return Err(ConsumerError::BrokerLost(e));
                }
            };

            update_stats(stats, |s| {
                s.received += 1;
                if delivery.is_redelivery() {
                    s.redeliveries += 1;
                }
            });

            if !self.settle(&delivery, shutdown_rx, stats) {
                info!(delivery_id = %delivery.id, "shutdown while submitting; delivery left for redelivery");
                break;
            }

            if let Err(e) = subscription.commit(&delivery) {
                error!(delivery_id = %delivery.id, error = %e, "failed to commit delivery");
                return Err(ConsumerError::BrokerLost(e));
            }
        }

        info!(consumer = %self.config.consumer_name, "fulfillment consumer stopped");
        Ok(())
    }

    /// Handle `delivery` until it may be committed. `false` means shutdown
    /// arrived first and the delivery must stay uncommitted.
    fn settle(
        &self,
        delivery: &Delivery,
        shutdown_rx: &mpsc::Receiver<()>,
        stats: &Mutex<ConsumerStats>,
    ) -> bool {
        let mut failures: u32 = 0;

        loop {
            match self.handle_delivery(delivery) {
                DeliveryOutcome::Submitted(job_id) => {
                    update_stats(stats, |s| s.submitted += 1);
                    debug!(delivery_id = %delivery.id, %job_id, "fulfillment job submitted");
                    return true;
                }
                DeliveryOutcome::Skipped(reason) => {
                    update_stats(stats, |s| s.skipped += 1);
                    warn!(
                        topic = %delivery.topic,
                        delivery_id = %delivery.id,
                        reason = %reason,
                        "skipping malformed event"
                    );
                    return true;
                }
                DeliveryOutcome::SubmitFailed(e) => {
                    let delay = self.config.submit_backoff.delay_for_retry(failures);
                    failures = failures.saturating_add(1);
                    update_stats(stats, |s| s.submit_retries += 1);
                    warn!(
                        delivery_id = %delivery.id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "failed to submit fulfillment job; retrying"
                    );

                    match shutdown_rx.recv_timeout(delay) {
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        _ => return false,
                    }
                }
            }
        }
    }
}

fn shutdown_requested(shutdown_rx: &mpsc::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

fn update_stats(stats: &Mutex<ConsumerStats>, f: impl FnOnce(&mut ConsumerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

/// Handle to control and join the consumer thread.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<Result<(), ConsumerError>>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    /// Request shutdown and wait for the thread.
    ///
    /// Returns the error the thread stopped with, if it stopped on its own.
    pub fn shutdown(mut self) -> Result<(), ConsumerError> {
        let _ = self.shutdown.send(());
        match self.join.take() {
            Some(join) => join.join().map_err(|_| ConsumerError::Panicked)?,
            None => Ok(()),
        }
    }

    /// Whether the thread has exited (only on shutdown or broker loss).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}
