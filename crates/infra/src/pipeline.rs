//! Pipeline wiring: one set of collaborator handles, shared by the write path,
//! the consumer and the worker pool.

use std::sync::Arc;

use tracing::info;

use orderflow_events::{Broker, InMemoryBroker};

use crate::cache::{InMemoryOrderCache, OrderCache};
use crate::config::PipelineConfig;
use crate::consumer::{ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerStats, FulfillmentConsumer};
use crate::fulfillment::{FulfillmentWorker, PaymentGateway, SimulatedPaymentGateway};
use crate::jobs::{ExecutorStats, InMemoryJobQueue, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobQueue};
use crate::orders::OrderService;
use crate::publisher::{FulfillmentPublisher, OrderIntake};
use crate::store::{InMemoryOrderStore, OrderStore};

/// Handles to the external systems, constructed once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn OrderStore>,
    pub cache: Arc<dyn OrderCache>,
    pub broker: Arc<dyn Broker>,
    pub queue: Arc<dyn JobQueue>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// In-memory collaborators (dev/test).
    pub fn in_memory(config: &PipelineConfig) -> Self {
        Self {
            store: Arc::new(InMemoryOrderStore::new()),
            cache: Arc::new(InMemoryOrderCache::new()),
            broker: Arc::new(InMemoryBroker::new()),
            queue: InMemoryJobQueue::arc(),
            gateway: Arc::new(SimulatedPaymentGateway::new(config.payment_processing)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error("failed to start job executor: {0}")]
    Executor(#[from] std::io::Error),
}

/// The assembled pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
    orders: OrderService,
    intake: OrderIntake,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let orders = OrderService::new(collaborators.store.clone(), collaborators.cache.clone())
            .with_cache_ttl(config.cache_ttl);
        let publisher = FulfillmentPublisher::with_topic(collaborators.broker.clone(), config.topic.clone());
        let intake = OrderIntake::new(orders.clone(), publisher);

        Self {
            config,
            collaborators,
            orders,
            intake,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    /// Order write path (create + publish).
    pub fn intake(&self) -> &OrderIntake {
        &self.intake
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.collaborators.queue
    }

    pub fn worker(&self) -> FulfillmentWorker {
        FulfillmentWorker::new(self.orders.clone(), self.collaborators.gateway.clone())
            .with_retry_policy(self.config.job_retry_policy.clone())
            .with_payment_timeout(self.config.payment_timeout)
    }

    pub fn consumer(&self) -> FulfillmentConsumer {
        let config = ConsumerConfig::default()
            .with_topic(self.config.topic.clone())
            .with_group(self.config.consumer_group.clone())
            .with_consumer_name(self.config.consumer_name.clone())
            .with_job_retry_policy(self.config.job_retry_policy.clone());
        FulfillmentConsumer::new(self.collaborators.queue.clone(), config)
    }

    /// Start the consumer thread and the worker pool.
    pub fn start(&self) -> Result<RunningPipeline, PipelineError> {
        let mut executor = JobExecutor::new(self.collaborators.queue.clone());
        self.worker().register(&mut executor);

        let executor = executor.spawn(
            JobExecutorConfig::default()
                .with_name("fulfillment")
                .with_max_concurrent(self.config.worker_concurrency)
                .with_poll_interval(self.config.poll_interval)
                .with_lease(self.config.job_lease),
        )?;

        let consumer = match self.consumer().spawn(self.collaborators.broker.as_ref()) {
            Ok(consumer) => consumer,
            Err(e) => {
                executor.shutdown();
                return Err(e.into());
            }
        };

        info!(
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            workers = self.config.worker_concurrency,
            "fulfillment pipeline started"
        );
        Ok(RunningPipeline { consumer, executor })
    }
}

/// Running consumer + worker pool.
#[derive(Debug)]
pub struct RunningPipeline {
    consumer: ConsumerHandle,
    executor: JobExecutorHandle,
}

impl RunningPipeline {
    pub fn consumer_stats(&self) -> ConsumerStats {
        self.consumer.stats()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// True once the consumer thread stopped on its own (broker lost).
    pub fn consumer_stopped(&self) -> bool {
        self.consumer.is_finished()
    }

    /// Stop consuming first, then drain the worker pool.
    pub fn shutdown(self) -> Result<(), ConsumerError> {
        let consumer = self.consumer.shutdown();
        self.executor.shutdown();
        info!("fulfillment pipeline stopped");
        consumer
    }
}
