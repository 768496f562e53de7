//! Infrastructure layer: order store, cache, broker adapters, job queue,
//! fulfillment worker, configuration.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod event_bus;
pub mod fulfillment;
pub mod jobs;
pub mod orders;
pub mod pipeline;
pub mod publisher;
pub mod store;

#[cfg(test)]
mod integration_tests;
