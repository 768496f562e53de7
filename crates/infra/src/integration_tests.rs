//! Integration tests for the whole in-memory pipeline.
//!
//! Tests: place order → broker → consumer → job queue → worker → store/cache
//!
//! Verifies:
//! - A placed order ends up PAID and the cache never serves a stale status
//! - Malformed events are skipped and committed without a job
//! - Redelivery after a crash between submit and commit is harmless
//! - Exhausted and permanent failures are dead-lettered with the order untouched

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    use orderflow_core::{LineItem, NewOrder, Order, OrderId, OrderStatus, OwnerId};
    use orderflow_events::{Broker, BrokerSubscription, FulfillmentEvent, InMemoryBroker, NEW_ORDER_TOPIC};

    use crate::cache::InMemoryOrderCache;
    use crate::config::PipelineConfig;
    use crate::consumer::DEFAULT_CONSUMER_GROUP;
    use crate::fulfillment::{Outcome, SimulatedPaymentGateway};
    use crate::jobs::{InMemoryJobQueue, JobQueue, JobStatus, PROCESS_ORDER_TASK, RetryPolicy};
    use crate::orders::{OrderService, OrderServiceError, Transition};
    use crate::pipeline::{Collaborators, Pipeline};
    use crate::publisher::{Handoff, HandoffPolicy};
    use crate::store::{InMemoryOrderStore, OrderStore};

    struct Harness {
        store: Arc<InMemoryOrderStore>,
        cache: Arc<InMemoryOrderCache>,
        broker: InMemoryBroker,
        queue: Arc<InMemoryJobQueue>,
        gateway: Arc<SimulatedPaymentGateway>,
        pipeline: Pipeline,
    }

    fn harness() -> Harness {
        let config = PipelineConfig {
            worker_concurrency: 2,
            poll_interval: Duration::from_millis(5),
            payment_processing: Duration::ZERO,
            job_retry_policy: RetryPolicy::exponential(
                3,
                Duration::from_millis(1),
                Duration::from_millis(10),
            ),
            consumer_name: "it-consumer".to_string(),
            ..PipelineConfig::default()
        };

        let store = Arc::new(InMemoryOrderStore::new());
        let cache = Arc::new(InMemoryOrderCache::new());
        let broker = InMemoryBroker::new();
        let queue = InMemoryJobQueue::arc();
        let gateway = Arc::new(SimulatedPaymentGateway::instant());

        let collaborators = Collaborators {
            store: store.clone(),
            cache: cache.clone(),
            broker: Arc::new(broker.clone()),
            queue: queue.clone(),
            gateway: gateway.clone(),
        };

        Harness {
            store,
            cache,
            broker,
            queue,
            gateway,
            pipeline: Pipeline::new(config, collaborators),
        }
    }

    fn new_order(owner: OwnerId) -> NewOrder {
        NewOrder::new(
            owner,
            vec![
                LineItem::new(json!({"sku": "A-1", "qty": 2})).unwrap(),
                LineItem::new(json!({"sku": "B-7", "qty": 1})).unwrap(),
            ],
            Decimal::new(4250, 2),
        )
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn status(h: &Harness, id: OrderId) -> Option<OrderStatus> {
        h.store.get_order(id).ok().flatten().map(|o| o.status)
    }

    #[test]
    fn placed_order_is_fulfilled_end_to_end() {
        let h = harness();
        let owner = OwnerId::new();

        let placed = h
            .pipeline
            .intake()
            .place_order(new_order(owner), HandoffPolicy::RequirePublish)
            .unwrap();
        assert_eq!(placed.order.status, OrderStatus::Pending);
        assert_eq!(placed.order.total_amount, Decimal::new(4250, 2));
        assert_eq!(placed.handoff, Handoff::Published);
        assert_eq!(h.broker.published_count(NEW_ORDER_TOPIC), 1);

        // The creation snapshot is cached and served to the owner.
        assert!(h.cache.contains(placed.order.id));

        let running = h.pipeline.start().unwrap();
        assert!(wait_until(|| running.executor_stats().jobs_succeeded == 1));
        assert!(wait_until(|| h.broker.committed_count(NEW_ORDER_TOPIC, DEFAULT_CONSUMER_GROUP) == 1));
        assert!(!h.cache.contains(placed.order.id));

        let read = h.pipeline.orders().read_order(owner, placed.order.id).unwrap();
        assert_eq!(read.status, OrderStatus::Paid);
        assert_eq!(read.line_items, placed.order.line_items);
        assert_eq!(h.gateway.capture_count(), 1);

        let stats = running.consumer_stats();
        assert_eq!(stats.submitted, 1);
        running.shutdown().unwrap();
    }

    #[test]
    fn malformed_event_is_skipped_without_job() {
        let h = harness();
        h.broker.publish(NEW_ORDER_TOPIC, b"{}".to_vec()).unwrap();

        let running = h.pipeline.start().unwrap();
        assert!(wait_until(|| h.broker.committed_count(NEW_ORDER_TOPIC, DEFAULT_CONSUMER_GROUP) == 1));

        assert_eq!(running.consumer_stats().skipped, 1);
        assert!(h.queue.jobs_for_task(PROCESS_ORDER_TASK).is_empty());
        running.shutdown().unwrap();
    }

    #[test]
    fn job_for_missing_order_is_dead_lettered_without_retry() {
        let h = harness();
        let missing = OrderId::new();
        h.broker
            .publish(NEW_ORDER_TOPIC, FulfillmentEvent::new(missing).to_bytes())
            .unwrap();

        let running = h.pipeline.start().unwrap();
        assert!(wait_until(|| h.queue.list_dead_letters(10).map(|d| d.len()).unwrap_or(0) == 1));

        let dead = h.queue.list_dead_letters(10).unwrap();
        assert_eq!(dead[0].job.attempt_count, 0);
        assert!(dead[0].reason.contains("not found"));
        assert_eq!(running.executor_stats().jobs_retried, 0);
        running.shutdown().unwrap();
    }

    #[test]
    fn redelivery_after_crash_before_commit_is_harmless() {
        let h = harness();
        let owner = OwnerId::new();
        let placed = h
            .pipeline
            .intake()
            .place_order(new_order(owner), HandoffPolicy::RequirePublish)
            .unwrap();

        // First consumer submits the job, then dies before committing.
        {
            let mut subscription = h
                .broker
                .subscribe(NEW_ORDER_TOPIC, DEFAULT_CONSUMER_GROUP, "crashed")
                .unwrap();
            let delivery = subscription
                .poll(Duration::from_millis(100))
                .unwrap()
                .unwrap();
            let outcome = h.pipeline.consumer().handle_delivery(&delivery);
            assert!(matches!(outcome, crate::consumer::DeliveryOutcome::Submitted(_)));
        }
        assert_eq!(h.broker.committed_count(NEW_ORDER_TOPIC, DEFAULT_CONSUMER_GROUP), 0);

        let running = h.pipeline.start().unwrap();
        assert!(wait_until(|| h.broker.committed_count(NEW_ORDER_TOPIC, DEFAULT_CONSUMER_GROUP) == 1));
        assert!(wait_until(|| {
            h.queue
                .jobs_for_task(PROCESS_ORDER_TASK)
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .count()
                == 2
        }));

        assert_eq!(running.consumer_stats().redeliveries, 1);
        assert_eq!(status(&h, placed.order.id), Some(OrderStatus::Paid));
        assert_eq!(h.gateway.capture_count(), 1);
        running.shutdown().unwrap();
    }

    #[test]
    fn exhausted_retries_dead_letter_then_replay_succeeds() {
        let h = harness();
        let owner = OwnerId::new();
        h.gateway.fail_next(4);

        let placed = h
            .pipeline
            .intake()
            .place_order(new_order(owner), HandoffPolicy::RequirePublish)
            .unwrap();
        let running = h.pipeline.start().unwrap();

        assert!(wait_until(|| h.queue.list_dead_letters(10).map(|d| d.len()).unwrap_or(0) == 1));
        let dead = h.queue.list_dead_letters(10).unwrap().remove(0);
        assert_eq!(dead.job.attempt_count, 3);
        assert!(dead.reason.contains("4 attempts"));
        assert_eq!(status(&h, placed.order.id), Some(OrderStatus::Pending));
        assert_eq!(h.gateway.attempt_count(), 4);

        // Operator replay once the gateway is healthy again.
        h.queue.retry_dead_letter(dead.job.id).unwrap();
        assert!(wait_until(|| running.executor_stats().jobs_succeeded == 1));
        assert_eq!(status(&h, placed.order.id), Some(OrderStatus::Paid));
        running.shutdown().unwrap();
    }

    #[test]
    fn publish_failure_compensates_or_leaves_gap() {
        let h = harness();
        let owner = OwnerId::new();
        h.broker.set_available(false);

        let err = h
            .pipeline
            .intake()
            .place_order(new_order(owner), HandoffPolicy::RequirePublish)
            .unwrap_err();
        let crate::publisher::PlaceOrderError::Publish { order_id, compensated, .. } = err else {
            panic!("expected publish error");
        };
        assert!(compensated);
        assert_eq!(status(&h, order_id), Some(OrderStatus::Canceled));

        let placed = h
            .pipeline
            .intake()
            .place_order(new_order(owner), HandoffPolicy::AllowGap)
            .unwrap();
        assert!(matches!(placed.handoff, Handoff::Gap { .. }));
        assert_eq!(status(&h, placed.order.id), Some(OrderStatus::Pending));
    }

    #[test]
    fn other_owner_is_rejected_on_cache_hit() {
        let h = harness();
        let owner = OwnerId::new();
        let placed = h
            .pipeline
            .intake()
            .place_order(new_order(owner), HandoffPolicy::AllowGap)
            .unwrap();
        assert!(h.cache.contains(placed.order.id));

        let hits_before = h.cache.stats().hits;
        let err = h
            .pipeline
            .orders()
            .read_order(OwnerId::new(), placed.order.id)
            .unwrap_err();
        assert!(matches!(err, OrderServiceError::NotAuthorized(_)));
        assert_eq!(h.cache.stats().hits, hits_before + 1);
    }

    #[test]
    fn concurrent_attempts_pay_exactly_once() {
        let h = harness();
        let placed = h
            .pipeline
            .orders()
            .create_order(new_order(OwnerId::new()))
            .unwrap();
        let worker = h.pipeline.worker();
        let id = placed.id.to_string();

        let outcomes: Vec<Outcome> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| worker.execute(&id, 0)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(outcomes.iter().all(|o| *o == Outcome::Paid));
        assert_eq!(h.gateway.capture_count(), 1);
        assert_eq!(status(&h, placed.id), Some(OrderStatus::Paid));
        assert!(!h.cache.contains(placed.id));
    }

    fn apply(orders: &OrderService, id: OrderId, step: u8) -> Result<Transition, OrderServiceError> {
        let (from, to) = match step % 4 {
            0 => (OrderStatus::Pending, OrderStatus::Paid),
            1 => (OrderStatus::Paid, OrderStatus::Shipped),
            2 => (OrderStatus::Pending, OrderStatus::Canceled),
            _ => (OrderStatus::Paid, OrderStatus::Canceled),
        };
        orders.transition(id, from, to)
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        /// Whatever sequence of transitions and reads happens, a read through
        /// the cache always matches the store.
        #[test]
        fn cached_reads_match_store(steps in proptest::collection::vec((any::<u8>(), any::<bool>()), 1..24)) {
            let store = Arc::new(InMemoryOrderStore::new());
            let cache = Arc::new(InMemoryOrderCache::new());
            let orders = OrderService::new(store.clone(), cache.clone());
            let owner = OwnerId::new();
            let order: Order = orders.create_order(new_order(owner)).unwrap();

            for (step, read_first) in steps {
                if read_first {
                    orders.read_order(owner, order.id).unwrap();
                }
                apply(&orders, order.id, step).unwrap();

                let read = orders.read_order(owner, order.id).unwrap();
                let stored = store.get_order(order.id).unwrap().unwrap();
                prop_assert_eq!(read, stored);
            }
        }
    }
}
