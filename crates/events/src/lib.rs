//! Fulfillment events and broker mechanics.
//!
//! - `event`: the `new_order` wire schema
//! - `broker`: transport-agnostic publish / consumer-group subscription traits
//! - `in_memory_broker`: broker for tests/dev with the same group semantics

pub mod broker;
pub mod event;
pub mod in_memory_broker;

pub use broker::{Broker, BrokerError, BrokerSubscription, Delivery};
pub use event::{EventDecodeError, FulfillmentEvent, NEW_ORDER_TOPIC};
pub use in_memory_broker::InMemoryBroker;
