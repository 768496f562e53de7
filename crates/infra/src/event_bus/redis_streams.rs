//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP) to provide:
//! - **Durable delivery**: entries persist until acknowledged (XACK)
//! - **Consumer groups**: each entry goes to one consumer of the group
//! - **Earliest start**: groups are created at id `0` with MKSTREAM
//! - **Redelivery**: on (re)subscribe a consumer first re-reads its own
//!   pending entries; entries left pending by a consumer that disappeared are
//!   taken over with XAUTOCLAIM once idle long enough
//!
//! ## Architecture
//!
//! - **Stream Key**: the topic name (e.g. `new_order`)
//! - **Entry fields**: `payload` (raw event bytes)
//! - **Consumer Groups**: one per consuming service (e.g. `order_consumer_group`)
//! - **Consumers**: named consumers within groups (stable names survive restarts)

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use orderflow_events::{Broker, BrokerError, BrokerSubscription, Delivery};

/// Entries fetched per XREADGROUP call.
const READ_BATCH: usize = 10;

/// Pending entries idle longer than this are claimed from other consumers.
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// How often an idle subscription looks for abandoned entries.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    claim_idle: Duration,
}

impl RedisStreamsBroker {
    /// Create a new Redis Streams broker.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            claim_idle: DEFAULT_CLAIM_IDLE,
        })
    }

    /// Idle time after which another consumer's pending entries are taken over.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    /// Ensure a consumer group exists (idempotent).
    fn ensure_consumer_group(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        group: &str,
    ) -> Result<(), BrokerError> {
        // "0": a new group starts at the earliest retained entry.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);

        match created {
            Ok(_) => {
                debug!(topic, group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(classify("XGROUP CREATE", e)),
        }
    }
}

/// Connection-level failures end the subscription; anything else is a
/// protocol error.
fn classify(command: &str, e: redis::RedisError) -> BrokerError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
    {
        BrokerError::Connection(format!("{} failed: {}", command, e))
    } else {
        BrokerError::Protocol(format!("{} failed: {}", command, e))
    }
}

impl Broker for RedisStreamsBroker {
    #[instrument(skip(self, payload), fields(topic = %topic, bytes = payload.len()), err)]
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*") // Auto-generate entry ID
            .arg("payload")
            .arg(payload)
            .query(&mut conn)
            .map_err(|e| BrokerError::Unavailable(format!("XADD failed: {}", e)))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        self.ensure_consumer_group(&mut conn, topic, group)?;

        Ok(Box::new(RedisStreamsSubscription {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            claim_idle: self.claim_idle,
            buffer: VecDeque::new(),
            reading_pending: true,
            last_reclaim: None,
        }))
    }
}

/// Consumer-group member reading one stream on a dedicated connection.
pub struct RedisStreamsSubscription {
    conn: redis::Connection,
    topic: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
    buffer: VecDeque<Delivery>,
    /// Still draining entries delivered to this consumer before and never acked.
    reading_pending: bool,
    last_reclaim: Option<Instant>,
}

impl RedisStreamsSubscription {
    fn read(&mut self, start_id: &str, block: Option<Duration>) -> Result<usize, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_BATCH);
        if let Some(block) = block {
            // BLOCK 0 would wait forever.
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.topic).arg(start_id);

        let reply: Option<redis::streams::StreamReadReply> = cmd
            .query(&mut self.conn)
            .map_err(|e| classify("XREADGROUP", e))?;

        let redelivered = start_id != ">";
        let mut stale = Vec::new();
        let mut read = 0;

        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                read += 1;
                match entry.get::<Vec<u8>>("payload") {
                    Some(payload) => self.buffer.push_back(Delivery {
                        topic: self.topic.clone(),
                        id: entry.id,
                        payload,
                        delivery_count: if redelivered { 2 } else { 1 },
                    }),
                    // Pending entry whose stream entry was trimmed or deleted.
                    None => stale.push(entry.id),
                }
            }
        }

        if !stale.is_empty() {
            warn!(topic = %self.topic, count = stale.len(), "acknowledging pending entries with no payload");
            self.ack(&stale)?;
        }
        Ok(read)
    }

    /// Take over entries other consumers left pending for too long.
    fn reclaim_abandoned(&mut self) -> Result<(), BrokerError> {
        self.last_reclaim = Some(Instant::now());

        let _: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(READ_BATCH)
            .arg("JUSTID")
            .query(&mut self.conn)
            .map_err(|e| classify("XAUTOCLAIM", e))?;

        // Claimed ids now sit in this consumer's pending list.
        self.reading_pending = true;
        Ok(())
    }

    fn ack(&mut self, ids: &[String]) -> Result<(), BrokerError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(ids)
            .query(&mut self.conn)
            .map_err(|e| classify("XACK", e))?;
        Ok(())
    }

    fn reclaim_due(&self) -> bool {
        self.last_reclaim
            .is_none_or(|at| at.elapsed() >= RECLAIM_INTERVAL)
    }
}

impl BrokerSubscription for RedisStreamsSubscription {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        if let Some(delivery) = self.buffer.pop_front() {
            return Ok(Some(delivery));
        }

        if !self.reading_pending && self.reclaim_due() {
            self.reclaim_abandoned()?;
        }

        if self.reading_pending {
            // "0": entries delivered to this consumer name and never acked.
            if self.read("0", None)? == 0 {
                self.reading_pending = false;
            }
        }

        if self.buffer.is_empty() {
            self.read(">", Some(timeout))?;
        }

        Ok(self.buffer.pop_front())
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ack(std::slice::from_ref(&delivery.id))
    }
}
