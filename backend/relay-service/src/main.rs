use std::sync::Arc;

use anyhow::{Context, Result};
use relay_service::config::Config;
use relay_service::metrics::RelayMetrics;
use relay_service::services::{
    BatchSink, PostgresSink, RedisStreamSource, StreamSource, StreamWorker,
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting relay-service");

    let config = Config::from_env().context("Failed to load configuration")?;

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(RelayMetrics::new(&registry));

    // Connection exhaustion here is fatal: abort startup rather than run
    // a relay that can read but never persist.
    let manager = Arc::new(db_pool::pg_manager(config.db.clone()));
    manager
        .acquire()
        .await
        .context("Failed to connect to PostgreSQL")?;
    tracing::info!("Database connection established");

    let source = RedisStreamSource::connect(
        &config.redis.url,
        &config.redis.stream,
        &config.redis.group,
    )
    .await
    .context("Failed to connect to Redis")?;
    source
        .ensure_group()
        .await
        .context("Failed to create consumer group")?;

    let source: Arc<dyn StreamSource> = Arc::new(source);
    let sink: Arc<dyn BatchSink> = Arc::new(PostgresSink::new(Arc::clone(&manager)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut workers = Vec::new();
    for consumer in &config.worker.consumers {
        let worker = Arc::new(StreamWorker::new(
            consumer.clone(),
            Arc::clone(&source),
            Arc::clone(&sink),
            config.worker.clone(),
            Arc::clone(&metrics),
        ));
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }
    tracing::info!(workers = workers.len(), "Relay workers running");

    for worker in workers {
        let _ = worker.await;
    }

    manager.close().await;
    tracing::info!("relay-service terminated gracefully");
    Ok(())
}
