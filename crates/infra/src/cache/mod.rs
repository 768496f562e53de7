//! Order cache (read-through snapshots keyed by order id).
//!
//! The cache is never the source of truth. Entries are JSON snapshots of
//! `Order` stored under `order:{id}` with a TTL; every mutation of an order
//! invalidates its entry (see `OrderService`), so a stale snapshot can only
//! survive until the writer's invalidation lands.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use orderflow_core::{Order, OrderId};

pub use in_memory::{CacheStats, InMemoryOrderCache};
#[cfg(feature = "redis")]
pub use self::redis::RedisOrderCache;

/// Default snapshot lifetime.
pub const DEFAULT_ORDER_TTL: Duration = Duration::from_secs(300);

/// Cache key for an order snapshot.
pub fn cache_key(id: OrderId) -> String {
    format!("order:{id}")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Cache unreachable (transient).
    #[error("order cache unavailable: {0}")]
    Unavailable(String),

    /// A stored snapshot could not be (de)serialized.
    #[error("order cache serialization error: {0}")]
    Serialization(String),
}

pub trait OrderCache: Send + Sync {
    /// `Ok(None)` on miss or expiry.
    fn read(&self, id: OrderId) -> Result<Option<Order>, CacheError>;

    fn write(&self, order: &Order, ttl: Duration) -> Result<(), CacheError>;

    /// Remove the entry; removing an absent key succeeds.
    fn invalidate(&self, id: OrderId) -> Result<(), CacheError>;
}

impl<C> OrderCache for Arc<C>
where
    C: OrderCache + ?Sized,
{
    fn read(&self, id: OrderId) -> Result<Option<Order>, CacheError> {
        (**self).read(id)
    }

    fn write(&self, order: &Order, ttl: Duration) -> Result<(), CacheError> {
        (**self).write(order, ttl)
    }

    fn invalidate(&self, id: OrderId) -> Result<(), CacheError> {
        (**self).invalidate(id)
    }
}

pub(crate) fn encode_snapshot(order: &Order) -> Result<String, CacheError> {
    serde_json::to_string(order).map_err(|e| CacheError::Serialization(e.to_string()))
}

pub(crate) fn decode_snapshot(raw: &str) -> Result<Order, CacheError> {
    serde_json::from_str(raw).map_err(|e| CacheError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_order_prefix() {
        let id: OrderId = "0190f1a4-7b7e-7c1a-9a43-2f1e2b3c4d5e".parse().unwrap();
        assert_eq!(cache_key(id), "order:0190f1a4-7b7e-7c1a-9a43-2f1e2b3c4d5e");
    }
}
