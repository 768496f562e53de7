//! `orderflow-core`: order domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the `Order` record and its status lifecycle, and the
//! validation applied when an order is created.

pub mod error;
pub mod id;
pub mod order;

pub use error::{DomainError, DomainResult};
pub use id::{OrderId, OwnerId};
pub use order::{LineItem, MAX_TOTAL_AMOUNT, NewOrder, Order, OrderStatus};
