//! Broker abstraction (mechanics only).
//!
//! A broker is the durable publish/subscribe transport between the order write
//! path and the asynchronous fulfillment pipeline.
//!
//! ## Delivery Guarantees
//!
//! - **Consumer groups**: every subscription joins a named group; each message
//!   is handed to one subscription of the group at a time
//! - **At-least-once**: a delivery that is not committed is redelivered after
//!   the subscription goes away (crash, restart, rebalance)
//! - **Earliest start**: a group that did not exist yet starts from the oldest
//!   retained message
//!
//! Consumers must therefore tolerate duplicates.
//!
//! ```text
//! Order write → publish(topic) → [broker] → poll → handle → commit
//!                                               ↑                 |
//!                                               └── redelivered ──┘ (if never committed)
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// One message handed to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    /// Broker-assigned position (offset or stream entry id).
    pub id: String,
    pub payload: Vec<u8>,
    /// How many times this message has been handed out to the group (1 = first).
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not accept a publish (unreachable, rejected).
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The subscription lost its broker connection; consumption cannot continue.
    #[error("broker connection lost: {0}")]
    Connection(String),

    /// The broker answered with something we could not interpret.
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

/// A consumer-group subscription.
///
/// Designed for single-threaded consumption: the consumer thread owns it.
pub trait BrokerSubscription: Send {
    /// Wait up to `timeout` for the next delivery.
    ///
    /// `Ok(None)` means nothing arrived in time.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery so the group never hands it out again.
    fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// Transport-agnostic broker.
///
/// Handles are constructed once at process start and shared (`Arc<dyn Broker>`).
pub trait Broker: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Join `group` on `topic` as `consumer`.
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        (**self).publish(topic, payload)
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn BrokerSubscription>, BrokerError> {
        (**self).subscribe(topic, group, consumer)
    }
}
