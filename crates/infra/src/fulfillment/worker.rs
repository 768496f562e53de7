//! The `process_order` job: capture payment, then move the order to `PAID`.
//!
//! ## Idempotency
//!
//! The job may run more than once for the same order (broker redelivery,
//! lease recovery, retries). Each run re-reads the order first:
//!
//! | current status | effect |
//! |----------------|--------|
//! | `PAID` / `SHIPPED` | nothing (cache entry invalidated), reported as `Paid` |
//! | `CANCELED` | nothing, permanent failure |
//! | `PENDING` | capture payment, then `PENDING -> PAID` through `OrderService::transition` |
//!
//! The conditional update makes concurrent runs race safely: exactly one
//! applies the transition, the others observe `PAID` and report `Paid`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use orderflow_core::{OrderId, OrderStatus};

use super::payment::{PaymentGateway, capture_with_timeout};
use crate::jobs::{Job, JobExecutor, JobResult, PROCESS_ORDER_TASK, RetryPolicy};
use crate::orders::{OrderService, Transition};

/// Why a fulfillment attempt will never succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("invalid order id: {0:?}")]
    InvalidOrderId(String),

    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("order {0} is canceled")]
    OrderCanceled(OrderId),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Result of one fulfillment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The order is `PAID` (now or already).
    Paid,
    /// Transient failure; run again after `delay`.
    Retry { delay: Duration, error: String },
    PermanentFailure(FailureReason),
}

/// Default bound on a single payment capture.
pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct FulfillmentWorker {
    orders: OrderService,
    gateway: Arc<dyn PaymentGateway>,
    retry_policy: RetryPolicy,
    payment_timeout: Duration,
}

impl std::fmt::Debug for FulfillmentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentWorker")
            .field("retry_policy", &self.retry_policy)
            .field("payment_timeout", &self.payment_timeout)
            .finish_non_exhaustive()
    }
}

impl FulfillmentWorker {
    pub fn new(orders: OrderService, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            orders,
            gateway,
            retry_policy: RetryPolicy::default(),
            payment_timeout: DEFAULT_PAYMENT_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = timeout;
        self
    }

    /// Register this worker as the `process_order` handler.
    pub fn register(self, executor: &mut JobExecutor) {
        executor.register_handler(PROCESS_ORDER_TASK, move |job| self.handle_job(job));
    }

    /// Run one attempt for `order_id`, `attempt_count` failures having happened before.
    pub fn execute(&self, order_id: &str, attempt_count: u32) -> Outcome {
        self.run(order_id, attempt_count, &self.retry_policy)
    }

    /// Job-handler adapter: uses the retry policy the job was enqueued with.
    pub fn handle_job(&self, job: &Job) -> JobResult {
        let Some(order_id) = job.order_id() else {
            return JobResult::Failure("job payload has no order_id".to_string());
        };

        match self.run(order_id, job.attempt_count, &job.retry_policy) {
            Outcome::Paid => JobResult::Success,
            Outcome::Retry { delay, error } => JobResult::RetryAfter { delay, error },
            Outcome::PermanentFailure(reason) => JobResult::Failure(reason.to_string()),
        }
    }

    fn run(&self, raw_id: &str, attempt_count: u32, policy: &RetryPolicy) -> Outcome {
        let id: OrderId = match raw_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(order_id = raw_id, "fulfillment job has an invalid order id");
                return Outcome::PermanentFailure(FailureReason::InvalidOrderId(raw_id.to_string()));
            }
        };

        let order = match self.orders.load(id) {
            Ok(Some(order)) => order,
            Ok(None) => return Outcome::PermanentFailure(FailureReason::OrderNotFound(id)),
            Err(e) => return retry_or_exhaust(id, policy, attempt_count, e.to_string()),
        };

        match order.status {
            OrderStatus::Canceled => {
                return Outcome::PermanentFailure(FailureReason::OrderCanceled(id));
            }
            status if status.is_fulfilled() => {
                info!(order_id = %id, %status, "order already paid; nothing to do");
                return match self.orders.invalidate(id) {
                    Ok(()) => Outcome::Paid,
                    Err(e) => retry_or_exhaust(id, policy, attempt_count, e.to_string()),
                };
            }
            _ => {}
        }

        if let Err(e) = capture_with_timeout(&self.gateway, &order, self.payment_timeout) {
            return retry_or_exhaust(id, policy, attempt_count, e.to_string());
        }

        match self
            .orders
            .transition(id, OrderStatus::Pending, OrderStatus::Paid)
        {
            Ok(Transition::Applied(_)) => {
                info!(order_id = %id, attempt = attempt_count + 1, "order paid");
                Outcome::Paid
            }
            Ok(Transition::Unchanged(current)) if current.status.is_fulfilled() => {
                info!(order_id = %id, "order paid by a concurrent attempt");
                Outcome::Paid
            }
            Ok(Transition::Unchanged(current)) => {
                // Canceled while the payment was being captured.
                error!(order_id = %id, status = %current.status, "payment captured for an order that is no longer pending");
                Outcome::PermanentFailure(FailureReason::OrderCanceled(id))
            }
            Ok(Transition::NotFound) => Outcome::PermanentFailure(FailureReason::OrderNotFound(id)),
            Err(e) => retry_or_exhaust(id, policy, attempt_count, e.to_string()),
        }
    }
}

fn retry_or_exhaust(id: OrderId, policy: &RetryPolicy, attempt_count: u32, error: String) -> Outcome {
    match policy.next_delay(attempt_count) {
        Some(delay) => {
            warn!(
                order_id = %id,
                attempt = attempt_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "fulfillment attempt failed; will retry"
            );
            Outcome::Retry { delay, error }
        }
        None => Outcome::PermanentFailure(FailureReason::Exhausted {
            attempts: attempt_count + 1,
            last_error: error,
        }),
    }
}
