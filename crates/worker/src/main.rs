use std::time::Duration;

use anyhow::Context;

use orderflow_infra::config::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let pipeline = orderflow_worker::services::build_pipeline(config).await?;

    // Pipeline threads are plain OS threads; keep the blocking start/stop
    // off the async workers.
    let running = tokio::task::spawn_blocking(move || pipeline.start())
        .await
        .context("pipeline start task failed")?
        .context("failed to start fulfillment pipeline")?;

    let mut check = tokio::time::interval(Duration::from_secs(1));
    let broker_lost = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                tracing::info!("shutdown requested");
                break false;
            }
            _ = check.tick() => {
                if running.consumer_stopped() {
                    break true;
                }
            }
        }
    };

    let result = tokio::task::spawn_blocking(move || running.shutdown())
        .await
        .context("pipeline shutdown task failed")?;

    match result {
        Ok(()) if !broker_lost => Ok(()),
        Ok(()) => anyhow::bail!("consumer stopped unexpectedly"),
        Err(e) => Err(e).context("fulfillment consumer failed"),
    }
}
