//! Order write path: persist, then hand off fulfillment through the broker.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use orderflow_core::{NewOrder, Order, OrderId, OrderStatus};
use orderflow_events::{Broker, BrokerError, FulfillmentEvent, NEW_ORDER_TOPIC};

use crate::orders::{OrderService, OrderServiceError, Transition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("failed to publish fulfillment event for order {order_id}: {source}")]
    Broker {
        order_id: OrderId,
        #[source]
        source: BrokerError,
    },
}

/// Publishes `FulfillmentEvent`s to the fulfillment topic.
///
/// Nothing is buffered locally: a broker failure is returned to the caller.
#[derive(Clone)]
pub struct FulfillmentPublisher {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl FulfillmentPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_topic(broker, NEW_ORDER_TOPIC)
    }

    pub fn with_topic(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[instrument(skip(self), fields(topic = %self.topic), err)]
    pub fn publish(&self, order_id: OrderId) -> Result<(), PublishError> {
        let payload = FulfillmentEvent::new(order_id).to_bytes();

        self.broker
            .publish(&self.topic, payload)
            .map_err(|source| PublishError::Broker { order_id, source })?;

        info!(%order_id, "fulfillment event published");
        Ok(())
    }
}

/// What to do when the order is committed but the event cannot be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffPolicy {
    /// Fail placement and cancel the committed order.
    RequirePublish,
    /// Keep the order `PENDING` and report the gap to the caller.
    AllowGap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    Published,
    /// Order stored but no fulfillment event exists for it.
    Gap { error: PublishError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub order: Order,
    pub handoff: Handoff,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaceOrderError {
    #[error(transparent)]
    Order(#[from] OrderServiceError),

    /// The publish failed; the order has been canceled (when `compensated`).
    #[error("order {order_id} not handed off: {source}")]
    Publish {
        order_id: OrderId,
        compensated: bool,
        #[source]
        source: PublishError,
    },
}

/// Order placement: durable write, cache snapshot, then publish.
#[derive(Clone, Debug)]
pub struct OrderIntake {
    orders: OrderService,
    publisher: FulfillmentPublisher,
}

impl std::fmt::Debug for FulfillmentPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentPublisher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl OrderIntake {
    pub fn new(orders: OrderService, publisher: FulfillmentPublisher) -> Self {
        Self { orders, publisher }
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    pub fn place_order(
        &self,
        order: NewOrder,
        policy: HandoffPolicy,
    ) -> Result<PlacedOrder, PlaceOrderError> {
        let order = self.orders.create_order(order)?;

        let error = match self.publisher.publish(order.id) {
            Ok(()) => {
                return Ok(PlacedOrder {
                    order,
                    handoff: Handoff::Published,
                });
            }
            Err(e) => e,
        };

        match policy {
            HandoffPolicy::AllowGap => {
                warn!(order_id = %order.id, error = %error, "order stored without fulfillment event");
                Ok(PlacedOrder {
                    order,
                    handoff: Handoff::Gap { error },
                })
            }
            HandoffPolicy::RequirePublish => {
                let compensated = self.compensate(order.id);
                Err(PlaceOrderError::Publish {
                    order_id: order.id,
                    compensated,
                    source: error,
                })
            }
        }
    }

    fn compensate(&self, order_id: OrderId) -> bool {
        match self
            .orders
            .transition(order_id, OrderStatus::Pending, OrderStatus::Canceled)
        {
            Ok(Transition::Applied(_)) => {
                warn!(%order_id, "order canceled after failed handoff");
                true
            }
            Ok(other) => {
                error!(%order_id, ?other, "could not cancel order after failed handoff");
                false
            }
            Err(e) => {
                error!(%order_id, error = %e, "could not cancel order after failed handoff");
                false
            }
        }
    }
}
