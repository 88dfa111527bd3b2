use std::sync::Arc;

use anyhow::{Context, Result};
use ingest_service::config::Config;
use ingest_service::metrics::IngestMetrics;
use ingest_service::services::SubscriberController;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ingest_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ingest-service");

    let config = Config::from_env().context("Failed to load configuration")?;

    // Created once here and injected; components never reach for global
    // metric state.
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(IngestMetrics::new(&registry));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let controller = SubscriberController::new(config, metrics);
    controller
        .run(shutdown_rx)
        .await
        .context("Ingest pipeline failed")?;

    tracing::info!("ingest-service terminated gracefully");
    Ok(())
}
