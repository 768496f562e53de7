//! Order service: the store/cache composition every caller goes through.
//!
//! ## Consistency rules
//!
//! - Creation writes the store first, then caches the snapshot.
//! - Reads try the cache; a miss (or a cache error) falls through to the store
//!   and repopulates the cache.
//! - Every status change goes through `transition`, which invalidates the
//!   cache entry right after the conditional update, whether or not it
//!   applied and before anything else can fail. A reader can therefore
//!   observe a stale snapshot only until the writer returns.
//! - A miss that read the store before a concurrent transition may write the
//!   older snapshot after that transition's invalidation. The populating read
//!   re-checks the stored status after its write and drops the entry if the
//!   status moved on; if that re-check itself fails the entry stays, bounded
//!   by the cache TTL.
//! - Ownership is checked on every read path, including cache hits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use orderflow_core::{NewOrder, Order, OrderId, OrderStatus, OwnerId};

use crate::cache::{CacheError, DEFAULT_ORDER_TTL, OrderCache};
use crate::store::{OrderStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderServiceError {
    #[error("order not found: {0}")]
    NotFound(OrderId),

    #[error("not authorized to access order {0}")]
    NotAuthorized(OrderId),

    #[error("invalid status change for order {id}: {from} -> {to}")]
    InvalidStatusChange {
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// The order changed between read and conditional update.
    #[error("order {0} was modified concurrently")]
    Conflict(OrderId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl OrderServiceError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OrderServiceError::Store(StoreError::Unavailable(_)) => true,
            OrderServiceError::Cache(CacheError::Unavailable(_)) => true,
            OrderServiceError::Conflict(_) => true,
            _ => false,
        }
    }
}

/// Result of a conditional status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The order was in `expected` and now carries `next`.
    Applied(Order),
    /// The order exists but was not in `expected`; its current state is returned.
    Unchanged(Order),
    NotFound,
}

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn OrderCache>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, cache: Arc<dyn OrderCache>) -> Self {
        Self {
            store,
            cache,
            cache_ttl: DEFAULT_ORDER_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Persist a new order and cache its snapshot.
    ///
    /// The store write is the commit point; a failing cache write is logged
    /// and does not fail creation (the next read repopulates the entry).
    pub fn create_order(&self, order: NewOrder) -> Result<Order, OrderServiceError> {
        let order = self.store.create_order(order)?;
        info!(order_id = %order.id, owner_id = %order.owner_id, "order created");

        if let Err(e) = self.cache.write(&order, self.cache_ttl) {
            warn!(order_id = %order.id, error = %e, "failed to cache new order");
        }
        Ok(order)
    }

    /// Read an order on behalf of `requester`.
    pub fn read_order(&self, requester: OwnerId, id: OrderId) -> Result<Order, OrderServiceError> {
        match self.cache.read(id) {
            Ok(Some(order)) => {
                if !order.is_owned_by(requester) {
                    return Err(OrderServiceError::NotAuthorized(id));
                }
                debug!(order_id = %id, "order cache hit");
                return Ok(order);
            }
            Ok(None) => debug!(order_id = %id, "order cache miss"),
            Err(e) => warn!(order_id = %id, error = %e, "order cache read failed; using store"),
        }

        let order = self
            .store
            .get_order(id)?
            .ok_or(OrderServiceError::NotFound(id))?;

        if !order.is_owned_by(requester) {
            return Err(OrderServiceError::NotAuthorized(id));
        }

        self.populate(&order);
        Ok(order)
    }

    /// Cache a snapshot read from the store, then drop it again if the stored
    /// status has moved on since that read.
    fn populate(&self, order: &Order) {
        if let Err(e) = self.cache.write(order, self.cache_ttl) {
            warn!(order_id = %order.id, error = %e, "failed to populate order cache");
            return;
        }

        let still_current = matches!(
            self.store.get_order(order.id),
            Ok(Some(current)) if current.status == order.status
        );
        if !still_current {
            debug!(order_id = %order.id, "order changed while populating cache");
            if let Err(e) = self.cache.invalidate(order.id) {
                warn!(order_id = %order.id, error = %e, "failed to drop stale cache entry");
            }
        }
    }

    /// Read straight from the store (no cache, no ownership check).
    pub fn load(&self, id: OrderId) -> Result<Option<Order>, OrderServiceError> {
        Ok(self.store.get_order(id)?)
    }

    /// The single state-update path.
    ///
    /// Applies `expected -> next` conditionally and invalidates the cache entry
    /// before returning, in every outcome.
    pub fn transition(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Transition, OrderServiceError> {
        let applied = self.store.compare_and_set_status(id, expected, next)?;
        // Invalidate before the read-back so a failing read cannot leave the
        // pre-transition snapshot cached.
        self.cache.invalidate(id)?;

        let current = self.store.get_order(id)?;

        let transition = match (applied, current) {
            (_, None) => Transition::NotFound,
            (true, Some(order)) => {
                info!(order_id = %id, from = %expected, to = %next, "order status changed");
                Transition::Applied(order)
            }
            (false, Some(order)) => {
                debug!(order_id = %id, expected = %expected, current = %order.status, "status change not applied");
                Transition::Unchanged(order)
            }
        };
        Ok(transition)
    }

    /// Drop the cached snapshot of `id`.
    pub fn invalidate(&self, id: OrderId) -> Result<(), OrderServiceError> {
        Ok(self.cache.invalidate(id)?)
    }

    /// Owner-authorized explicit status change (e.g. `PAID -> SHIPPED`, cancel).
    ///
    /// Which transitions are allowed is the caller's policy; setting the status
    /// an order already has is rejected. A concurrent change between the read
    /// and the conditional update yields `Conflict`.
    pub fn update_status(
        &self,
        requester: OwnerId,
        id: OrderId,
        next: OrderStatus,
    ) -> Result<Order, OrderServiceError> {
        let current = self
            .store
            .get_order(id)?
            .ok_or(OrderServiceError::NotFound(id))?;

        if !current.is_owned_by(requester) {
            return Err(OrderServiceError::NotAuthorized(id));
        }
        if current.status == next {
            return Err(OrderServiceError::InvalidStatusChange {
                id,
                from: current.status,
                to: next,
            });
        }

        match self.transition(id, current.status, next)? {
            Transition::Applied(order) => Ok(order),
            Transition::Unchanged(_) => Err(OrderServiceError::Conflict(id)),
            Transition::NotFound => Err(OrderServiceError::NotFound(id)),
        }
    }

    /// All orders of `requester`, oldest first (always from the store).
    pub fn list_orders(&self, requester: OwnerId) -> Result<Vec<Order>, OrderServiceError> {
        Ok(self.store.list_by_owner(requester)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryOrderCache;
    use crate::store::InMemoryOrderStore;
    use orderflow_core::LineItem;
    use rust_decimal::Decimal;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        store: Arc<InMemoryOrderStore>,
        cache: Arc<InMemoryOrderCache>,
        service: OrderService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryOrderStore::new());
        let cache = Arc::new(InMemoryOrderCache::new());
        let service = OrderService::new(store.clone(), cache.clone());
        Fixture {
            store,
            cache,
            service,
        }
    }

    fn new_order(owner: OwnerId) -> NewOrder {
        NewOrder::new(
            owner,
            vec![LineItem::new(serde_json::json!({"sku": "A-1", "qty": 1})).unwrap()],
            Decimal::new(4250, 2),
        )
        .unwrap()
    }

    #[test]
    fn create_caches_snapshot() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();

        assert!(f.cache.contains(order.id));
        assert_eq!(f.service.read_order(owner, order.id).unwrap(), order);
        assert_eq!(f.cache.stats().hits, 1);
    }

    #[test]
    fn create_survives_cache_outage() {
        let f = fixture();
        f.cache.set_available(false);
        let owner = OwnerId::new();

        let order = f.service.create_order(new_order(owner)).unwrap();
        assert!(f.store.get_order(order.id).unwrap().is_some());
    }

    #[test]
    fn cache_hit_still_checks_owner() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();

        let err = f.service.read_order(OwnerId::new(), order.id).unwrap_err();
        assert_eq!(err, OrderServiceError::NotAuthorized(order.id));
    }

    #[test]
    fn miss_reads_store_and_repopulates() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();
        f.cache.invalidate(order.id).unwrap();

        assert_eq!(f.service.read_order(owner, order.id).unwrap(), order);
        assert!(f.cache.contains(order.id));
    }

    #[test]
    fn cache_error_falls_through_to_store() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();
        f.cache.set_available(false);

        assert_eq!(f.service.read_order(owner, order.id).unwrap(), order);
    }

    #[test]
    fn missing_order_is_not_found() {
        let f = fixture();
        let id = OrderId::new();
        assert_eq!(
            f.service.read_order(OwnerId::new(), id).unwrap_err(),
            OrderServiceError::NotFound(id)
        );
    }

    #[test]
    fn transition_invalidates_whether_or_not_applied() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();

        let first = f
            .service
            .transition(order.id, OrderStatus::Pending, OrderStatus::Paid)
            .unwrap();
        assert!(matches!(first, Transition::Applied(ref o) if o.status == OrderStatus::Paid));
        assert!(!f.cache.contains(order.id));

        // Repopulate, then a no-op transition must still invalidate.
        f.service.read_order(owner, order.id).unwrap();
        let second = f
            .service
            .transition(order.id, OrderStatus::Pending, OrderStatus::Paid)
            .unwrap();
        assert!(matches!(second, Transition::Unchanged(ref o) if o.status == OrderStatus::Paid));
        assert!(!f.cache.contains(order.id));
        assert_eq!(f.cache.stats().invalidations, 2);
    }

    #[test]
    fn transition_on_missing_order() {
        let f = fixture();
        assert_eq!(
            f.service
                .transition(OrderId::new(), OrderStatus::Pending, OrderStatus::Paid)
                .unwrap(),
            Transition::NotFound
        );
    }

    #[test]
    fn transition_fails_when_invalidation_fails() {
        let f = fixture();
        let order = f.service.create_order(new_order(OwnerId::new())).unwrap();
        f.cache.set_available(false);

        let err = f
            .service
            .transition(order.id, OrderStatus::Pending, OrderStatus::Paid)
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn read_after_transition_sees_new_status() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();

        f.service
            .transition(order.id, OrderStatus::Pending, OrderStatus::Paid)
            .unwrap();
        assert_eq!(
            f.service.read_order(owner, order.id).unwrap().status,
            OrderStatus::Paid
        );
    }

    #[test]
    fn update_status_checks_owner_and_applies() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();

        assert_eq!(
            f.service
                .update_status(OwnerId::new(), order.id, OrderStatus::Canceled)
                .unwrap_err(),
            OrderServiceError::NotAuthorized(order.id)
        );

        let canceled = f
            .service
            .update_status(owner, order.id, OrderStatus::Canceled)
            .unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert!(!f.cache.contains(order.id));
    }

    #[test]
    fn update_status_to_same_status_is_rejected() {
        let f = fixture();
        let owner = OwnerId::new();
        let order = f.service.create_order(new_order(owner)).unwrap();

        assert!(matches!(
            f.service.update_status(owner, order.id, OrderStatus::Pending),
            Err(OrderServiceError::InvalidStatusChange { .. })
        ));
    }

    #[test]
    fn failed_read_back_after_transition_leaves_no_stale_entry() {
        let store = Arc::new(FlakyStore::default());
        let cache = Arc::new(InMemoryOrderCache::new());
        let service = OrderService::new(store.clone(), cache.clone());
        let owner = OwnerId::new();
        let order = service.create_order(new_order(owner)).unwrap();
        assert!(cache.contains(order.id));

        store.fail_reads.store(true, Ordering::SeqCst);
        let err = service
            .transition(order.id, OrderStatus::Pending, OrderStatus::Paid)
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!cache.contains(order.id));

        store.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(
            service.read_order(owner, order.id).unwrap().status,
            OrderStatus::Paid
        );
    }

    #[test]
    fn populate_racing_a_transition_does_not_keep_old_snapshot() {
        let store = Arc::new(FlakyStore::default());
        let cache = Arc::new(InMemoryOrderCache::new());
        let service = OrderService::new(store.clone(), cache.clone());
        let owner = OwnerId::new();
        let order = service.create_order(new_order(owner)).unwrap();
        cache.invalidate(order.id).unwrap();

        // A transition commits and invalidates between the reader's store
        // read and its cache write.
        let (inner, racing_cache, id) = (store.inner.clone(), cache.clone(), order.id);
        *store.after_read.lock().unwrap() = Some(Box::new(move || {
            assert!(inner
                .compare_and_set_status(id, OrderStatus::Pending, OrderStatus::Paid)
                .unwrap());
            racing_cache.invalidate(id).unwrap();
        }));

        let seen = service.read_order(owner, order.id).unwrap();
        assert_eq!(seen.status, OrderStatus::Pending);
        assert!(!cache.contains(order.id));
        assert_eq!(
            service.read_order(owner, order.id).unwrap().status,
            OrderStatus::Paid
        );
    }

    /// In-memory store whose reads can be failed or intercepted.
    #[derive(Default)]
    struct FlakyStore {
        inner: Arc<InMemoryOrderStore>,
        fail_reads: AtomicBool,
        after_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl OrderStore for FlakyStore {
        fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
            self.inner.create_order(order)
        }

        fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("reads failing".into()));
            }
            let order = self.inner.get_order(id);
            let hook = self.after_read.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            order
        }

        fn compare_and_set_status(
            &self,
            id: OrderId,
            expected: OrderStatus,
            next: OrderStatus,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_set_status(id, expected, next)
        }

        fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Order>, StoreError> {
            self.inner.list_by_owner(owner_id)
        }
    }

    #[test]
    fn list_orders_returns_only_requesters_orders() {
        let f = fixture();
        let alice = OwnerId::new();
        let first = f.service.create_order(new_order(alice)).unwrap();
        let second = f.service.create_order(new_order(alice)).unwrap();
        f.service.create_order(new_order(OwnerId::new())).unwrap();

        let listed = f.service.list_orders(alice).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first) && listed.contains(&second));
    }
}
