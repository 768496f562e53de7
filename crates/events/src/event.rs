use serde::{Deserialize, Serialize};
use thiserror::Error;

use orderflow_core::OrderId;

/// Topic carrying "new order" events from the write path to the consumer.
pub const NEW_ORDER_TOPIC: &str = "new_order";

/// Event emitted once an order has been durably created.
///
/// Carries the order identifier only: the fulfillment job re-reads the order,
/// so the job stays the single place that mutates order state.
///
/// Wire format: `{"order_id": "<uuid>"}`, UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentEvent {
    pub order_id: String,
}

/// Permanent decode failure; retrying the same bytes cannot fix it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no order_id")]
    MissingOrderId,
}

impl FulfillmentEvent {
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id: order_id.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct with a single string field cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a broker payload.
    ///
    /// Unknown extra fields are ignored; `order_id` must be a non-empty string.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventDecodeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| EventDecodeError::InvalidJson(e.to_string()))?;

        let obj = value.as_object().ok_or(EventDecodeError::NotAnObject)?;

        match obj.get("order_id").and_then(|v| v.as_str()) {
            Some(id) if !id.trim().is_empty() => Ok(Self {
                order_id: id.to_string(),
            }),
            _ => Err(EventDecodeError::MissingOrderId),
        }
    }
}
