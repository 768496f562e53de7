//! Order store boundary (source of truth for orders).
//!
//! The store is the only durable record of an order. Status changes go
//! through `compare_and_set_status`, a single atomic read-modify-write, so two
//! concurrent fulfillment attempts can never both apply the same transition.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use orderflow_core::{NewOrder, Order, OrderId, OrderStatus, OwnerId};

pub use in_memory::InMemoryOrderStore;
pub use postgres::PostgresOrderStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("order already exists: {0}")]
    AlreadyExists(OrderId),
    /// A persisted status outside the closed `OrderStatus` set.
    #[error("invalid status in storage: {0}")]
    InvalidStatus(String),
    /// Store unreachable (transient).
    #[error("order store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable order storage.
pub trait OrderStore: Send + Sync {
    /// Persist a new order (`status = PENDING`), assigning its id and creation time.
    fn create_order(&self, order: NewOrder) -> Result<Order, StoreError>;

    fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Set `status = next` only if the current status is `expected`.
    ///
    /// Returns whether the update was applied. A missing order is `Ok(false)`.
    fn compare_and_set_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, StoreError>;

    /// All orders placed by `owner_id`, oldest first.
    fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Order>, StoreError>;
}

impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        (**self).create_order(order)
    }

    fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        (**self).get_order(id)
    }

    fn compare_and_set_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_set_status(id, expected, next)
    }

    fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Order>, StoreError> {
        (**self).list_by_owner(owner_id)
    }
}
