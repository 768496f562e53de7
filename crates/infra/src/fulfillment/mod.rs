//! Fulfillment: the work behind a `process_order` job.

pub mod payment;
pub mod worker;

pub use payment::{
    PaymentError, PaymentGateway, PaymentReceipt, SimulatedPaymentGateway, capture_with_timeout,
};
pub use worker::{DEFAULT_PAYMENT_TIMEOUT, FailureReason, FulfillmentWorker, Outcome};
