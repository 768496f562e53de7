use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;

use orderflow_core::{NewOrder, Order, OrderId, OrderStatus, OwnerId};

use super::{OrderStore, StoreError};

/// In-memory order store for tests/dev.
///
/// `set_available(false)` makes every call fail with `StoreError::Unavailable`.
#[derive(Debug)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
    available: AtomicBool,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remove an order outright (simulates a row deleted behind the pipeline's back).
    pub fn remove(&self, id: OrderId) -> Option<Order> {
        self.orders.write().ok()?.remove(&id)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("order store lock poisoned".to_string())
}

impl OrderStore for InMemoryOrderStore {
    fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        self.check_available()?;
        let mut orders = self.orders.write().map_err(|_| poisoned())?;

        let order = order.into_order(OrderId::new(), Utc::now());
        if orders.contains_key(&order.id) {
            return Err(StoreError::AlreadyExists(order.id));
        }
        orders.insert(order.id, order.clone());
        Ok(order)
    }

    fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.check_available()?;
        let orders = self.orders.read().map_err(|_| poisoned())?;
        Ok(orders.get(&id).cloned())
    }

    fn compare_and_set_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut orders = self.orders.write().map_err(|_| poisoned())?;

        match orders.get_mut(&id) {
            Some(order) if order.status == expected => {
                order.status = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Order>, StoreError> {
        self.check_available()?;
        let orders = self.orders.read().map_err(|_| poisoned())?;

        let mut owned: Vec<Order> = orders
            .values()
            .filter(|o| o.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by_key(|o| (o.created_at, o.id));
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow_core::LineItem;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn new_order(owner: OwnerId) -> NewOrder {
        NewOrder::new(
            owner,
            vec![LineItem::new(serde_json::json!({"sku": "A-1"})).unwrap()],
            Decimal::new(1999, 2),
        )
        .unwrap()
    }

    #[test]
    fn create_then_get() {
        let store = InMemoryOrderStore::new();
        let created = store.create_order(new_order(OwnerId::new())).unwrap();

        let loaded = store.get_order(created.id).unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.status, OrderStatus::Pending);
    }

    #[test]
    fn compare_and_set_applies_once() {
        let store = InMemoryOrderStore::new();
        let order = store.create_order(new_order(OwnerId::new())).unwrap();

        assert!(store
            .compare_and_set_status(order.id, OrderStatus::Pending, OrderStatus::Paid)
            .unwrap());
        assert!(!store
            .compare_and_set_status(order.id, OrderStatus::Pending, OrderStatus::Paid)
            .unwrap());
        assert_eq!(
            store.get_order(order.id).unwrap().unwrap().status,
            OrderStatus::Paid
        );
    }

    #[test]
    fn compare_and_set_on_missing_order_is_not_applied() {
        let store = InMemoryOrderStore::new();
        assert!(!store
            .compare_and_set_status(OrderId::new(), OrderStatus::Pending, OrderStatus::Paid)
            .unwrap());
    }

    #[test]
    fn concurrent_compare_and_set_has_one_winner() {
        let store = Arc::new(InMemoryOrderStore::new());
        let order = store.create_order(new_order(OwnerId::new())).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .compare_and_set_status(order.id, OrderStatus::Pending, OrderStatus::Paid)
                        .unwrap()
                })
            })
            .collect();

        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|applied| *applied)
            .count();
        assert_eq!(applied, 1);
    }

    #[test]
    fn list_by_owner_filters() {
        let store = InMemoryOrderStore::new();
        let alice = OwnerId::new();
        let bob = OwnerId::new();

        store.create_order(new_order(alice)).unwrap();
        store.create_order(new_order(alice)).unwrap();
        store.create_order(new_order(bob)).unwrap();

        assert_eq!(store.list_by_owner(alice).unwrap().len(), 2);
        assert_eq!(store.list_by_owner(bob).unwrap().len(), 1);
    }

    #[test]
    fn offline_store_reports_unavailable() {
        let store = InMemoryOrderStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get_order(OrderId::new()),
            Err(StoreError::Unavailable(_))
        ));
    }
}
