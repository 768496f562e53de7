//! `orderflow-worker`: runs the fulfillment consumer and worker pool.

pub mod services;
