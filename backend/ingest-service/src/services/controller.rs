//! Composes the full ingest pipeline and owns its shutdown.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::metrics::IngestMetrics;
use crate::queue::{AdaptiveBatchQueue, QueueConfig};
use crate::services::flush::{BatchFlusher, BatchSink, PostgresSink};
use crate::services::mqtt::MqttIngest;

pub struct SubscriberController {
    config: Config,
    metrics: Arc<IngestMetrics>,
}

impl SubscriberController {
    pub fn new(config: Config, metrics: Arc<IngestMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Bring up the sink connection, run migrations, then run the ingest
    /// and flush tasks until shutdown. Connection exhaustion during
    /// startup propagates out so the process aborts instead of running
    /// degraded.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let manager = Arc::new(db_pool::pg_manager(self.config.db.clone()));
        let pool = manager.acquire().await?;
        info!("Database connection established");

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations applied");

        let sub = &self.config.subscriber;
        let queue = Arc::new(AdaptiveBatchQueue::new(
            QueueConfig {
                initial_batch_size: sub.batch_size,
                min_batch_size: sub.min_batch_size,
                max_batch_size: sub.max_batch_size,
                max_size: sub.queue_max_size,
                overflow: sub.overflow,
            },
            Arc::clone(&self.metrics),
        ));
        let flush_signal = Arc::new(Notify::new());

        let ingest = Arc::new(MqttIngest::new(
            self.config.mqtt.clone(),
            sub.mqtt_reconnect_delay,
            sub.error_retry_delay,
            Arc::clone(&queue),
            Arc::clone(&flush_signal),
            Arc::clone(&self.metrics),
        ));
        let sink: Arc<dyn BatchSink> = Arc::new(PostgresSink::new(Arc::clone(&manager)));
        let flusher = Arc::new(BatchFlusher::new(
            Arc::clone(&queue),
            sink,
            flush_signal,
            sub.flush_interval,
            Arc::clone(&self.metrics),
        ));

        let ingest_task = {
            let ingest = Arc::clone(&ingest);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { ingest.run(shutdown).await })
        };
        let flush_task = {
            let flusher = Arc::clone(&flusher);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { flusher.run(shutdown).await })
        };

        // Both tasks exit only on shutdown; the flusher drains the queue
        // before returning.
        let _ = tokio::join!(ingest_task, flush_task);

        manager.close().await;
        info!("Pipeline stopped");
        Ok(())
    }
}
