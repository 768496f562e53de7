//! Payment side effect of fulfillment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use orderflow_core::{Order, OrderId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub order_id: OrderId,
    pub amount: Decimal,
    pub reference: Uuid,
    pub captured_at: DateTime<Utc>,
}

/// Payment failures. All of them are transient from the pipeline's view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),

    #[error("payment capture timed out after {0:?}")]
    Timeout(Duration),
}

/// Captures payment for an order.
///
/// Implementations must be idempotent per order id: capturing an order that
/// was already captured returns the original receipt without charging again.
pub trait PaymentGateway: Send + Sync {
    fn capture(&self, order: &Order) -> Result<PaymentReceipt, PaymentError>;
}

impl<G> PaymentGateway for Arc<G>
where
    G: PaymentGateway + ?Sized,
{
    fn capture(&self, order: &Order) -> Result<PaymentReceipt, PaymentError> {
        (**self).capture(order)
    }
}

/// Run `gateway.capture(order)` on a helper thread and give up after `timeout`.
///
/// A capture that outlives the timeout keeps running in the background; the
/// gateway's idempotency makes the retry that follows safe.
pub fn capture_with_timeout(
    gateway: &Arc<dyn PaymentGateway>,
    order: &Order,
    timeout: Duration,
) -> Result<PaymentReceipt, PaymentError> {
    let (tx, rx) = std::sync::mpsc::channel();
    let gateway = gateway.clone();
    let order = order.clone();

    thread::Builder::new()
        .name("payment-capture".to_string())
        .spawn(move || {
            let _ = tx.send(gateway.capture(&order));
        })
        .map_err(|e| PaymentError::Unavailable(format!("failed to start capture: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(PaymentError::Timeout(timeout)),
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(PaymentError::Unavailable(
            "capture thread exited without a result".to_string(),
        )),
    }
}

/// Stand-in gateway: takes `processing_delay`, then records a receipt.
///
/// `fail_next(n)` makes the next `n` captures fail with `Unavailable`.
#[derive(Debug)]
pub struct SimulatedPaymentGateway {
    processing_delay: Duration,
    receipts: Mutex<HashMap<OrderId, PaymentReceipt>>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl SimulatedPaymentGateway {
    pub fn new(processing_delay: Duration) -> Self {
        Self {
            processing_delay,
            receipts: Mutex::new(HashMap::new()),
            failures_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// No processing delay (tests).
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Distinct orders charged so far.
    pub fn capture_count(&self) -> usize {
        self.receipts.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Calls to `capture`, successful or not.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn receipt(&self, order_id: OrderId) -> Option<PaymentReceipt> {
        self.receipts.lock().ok()?.get(&order_id).cloned()
    }
}

impl Default for SimulatedPaymentGateway {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl PaymentGateway for SimulatedPaymentGateway {
    fn capture(&self, order: &Order) -> Result<PaymentReceipt, PaymentError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.processing_delay.is_zero() {
            thread::sleep(self.processing_delay);
        }

        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PaymentError::Unavailable("simulated gateway outage".to_string()));
        }

        let mut receipts = self
            .receipts
            .lock()
            .map_err(|_| PaymentError::Unavailable("gateway state poisoned".to_string()))?;

        if let Some(existing) = receipts.get(&order.id) {
            debug!(order_id = %order.id, "payment already captured");
            return Ok(existing.clone());
        }

        let receipt = PaymentReceipt {
            order_id: order.id,
            amount: order.total_amount,
            reference: Uuid::now_v7(),
            captured_at: Utc::now(),
        };
        receipts.insert(order.id, receipt.clone());
        info!(order_id = %order.id, amount = %order.total_amount, "payment captured");
        Ok(receipt)
    }
}
