//! Collaborator wiring for the worker process.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use orderflow_infra::config::PipelineConfig;
use orderflow_infra::pipeline::{Collaborators, Pipeline};
use orderflow_infra::store::PostgresOrderStore;

/// Build the pipeline for `config`.
///
/// `USE_PERSISTENT_STORES=true` selects Postgres + Redis (requires the
/// `redis` feature); otherwise everything is in-memory.
pub async fn build_pipeline(config: PipelineConfig) -> anyhow::Result<Pipeline> {
    let collaborators = if config.use_persistent_stores {
        build_persistent(&config).await?
    } else {
        info!("using in-memory collaborators");
        Collaborators::in_memory(&config)
    };

    Ok(Pipeline::new(config, collaborators))
}

async fn connect_postgres(config: &PipelineConfig) -> anyhow::Result<PgPool> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

#[cfg(feature = "redis")]
async fn build_persistent(config: &PipelineConfig) -> anyhow::Result<Collaborators> {
    use orderflow_infra::cache::RedisOrderCache;
    use orderflow_infra::event_bus::RedisStreamsBroker;
    use orderflow_infra::fulfillment::SimulatedPaymentGateway;
    use orderflow_infra::jobs::RedisJobQueue;

    let pool = connect_postgres(config).await?;
    let store = PostgresOrderStore::new(pool, tokio::runtime::Handle::current());

    let redis_url = config.redis_url.clone();
    let (cache, broker, queue) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let cache = RedisOrderCache::new(&redis_url).context("failed to create Redis order cache")?;
        cache.ping().context("Redis is not reachable")?;
        let broker = RedisStreamsBroker::new(&redis_url)
            .context("failed to create Redis Streams broker")?;
        let queue = RedisJobQueue::new(&redis_url).context("failed to create Redis job queue")?;
        Ok((cache, broker, queue))
    })
    .await
    .context("redis setup task failed")??;

    info!(redis_url = %config.redis_url, "using Postgres + Redis collaborators");

    Ok(Collaborators {
        store: Arc::new(store),
        cache: Arc::new(cache),
        broker: Arc::new(broker),
        queue: Arc::new(queue),
        gateway: Arc::new(SimulatedPaymentGateway::new(config.payment_processing)),
    })
}

#[cfg(not(feature = "redis"))]
async fn build_persistent(config: &PipelineConfig) -> anyhow::Result<Collaborators> {
    tracing::warn!("USE_PERSISTENT_STORES=true but redis feature not enabled; only the order store is persistent");

    let pool = connect_postgres(config).await?;
    let store = PostgresOrderStore::new(pool, tokio::runtime::Handle::current());

    Ok(Collaborators {
        store: Arc::new(store),
        ..Collaborators::in_memory(config)
    })
}
