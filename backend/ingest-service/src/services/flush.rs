//! Flush task: drains batches from the queue into the sink
//!
//! Wakes on the immediate-flush signal or on the flush interval, whichever
//! comes first. A failed write discards the batch: this path is
//! at-most-once, the queue never sees a batch again once drained.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use db_pool::PgConnectionManager;
use sqlx::{Postgres, QueryBuilder};
use telemetry_schema::SensorReading;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

use crate::error::{IngestError, Result};
use crate::metrics::IngestMetrics;
use crate::queue::AdaptiveBatchQueue;

/// Destination for drained batches. Production writes to PostgreSQL; tests
/// substitute a recording sink.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn write(&self, batch: &[SensorReading]) -> Result<()>;
}

/// Writes each batch as one multi-row INSERT.
pub struct PostgresSink {
    manager: Arc<PgConnectionManager>,
}

impl PostgresSink {
    pub fn new(manager: Arc<PgConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl BatchSink for PostgresSink {
    async fn write(&self, batch: &[SensorReading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let pool = self.manager.acquire().await?;
        let mut query = QueryBuilder::<Postgres>::new(
            "INSERT INTO sensor_data (device_id, timestamp, temperature, humidity) ",
        );
        query.push_values(batch, |mut row, reading| {
            row.push_bind(&reading.device_id)
                .push_bind(reading.timestamp)
                .push_bind(reading.temperature)
                .push_bind(reading.humidity);
        });
        query.build().execute(&pool).await.map_err(IngestError::from)?;
        Ok(())
    }
}

pub struct BatchFlusher {
    queue: Arc<AdaptiveBatchQueue>,
    sink: Arc<dyn BatchSink>,
    flush_signal: Arc<Notify>,
    flush_interval: Duration,
    metrics: Arc<IngestMetrics>,
}

impl BatchFlusher {
    pub fn new(
        queue: Arc<AdaptiveBatchQueue>,
        sink: Arc<dyn BatchSink>,
        flush_signal: Arc<Notify>,
        flush_interval: Duration,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            queue,
            sink,
            flush_signal,
            flush_interval,
            metrics,
        }
    }

    /// Run until the shutdown signal fires, then drain whatever is left.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "Batch flusher started"
        );
        loop {
            tokio::select! {
                // Either the ingest task signalled backlog pressure or the
                // interval elapsed; consuming `notified` clears the signal.
                _ = tokio::time::timeout(self.flush_interval, self.flush_signal.notified()) => {
                    self.flush_once().await;
                }
                _ = shutdown.changed() => {
                    info!("Batch flusher stopping, draining queue");
                    self.drain().await;
                    return;
                }
            }
        }
    }

    async fn flush_once(&self) {
        let batch = self.queue.get_batch().await;
        if batch.is_empty() {
            return;
        }
        match self.sink.write(&batch).await {
            Ok(()) => {
                self.metrics.batches_written.inc();
                self.metrics.rows_written.inc_by(batch.len() as u64);
                debug!(rows = batch.len(), "Flushed batch");
            }
            Err(e) => {
                // The batch is gone: at-most-once on this path.
                self.metrics.write_failures.inc();
                error!(rows = batch.len(), error = %e, "Batch write failed, batch discarded");
            }
        }
    }

    async fn drain(&self) {
        loop {
            let batch = self.queue.get_batch().await;
            if batch.is_empty() {
                return;
            }
            match self.sink.write(&batch).await {
                Ok(()) => {
                    self.metrics.batches_written.inc();
                    self.metrics.rows_written.inc_by(batch.len() as u64);
                }
                Err(e) => {
                    self.metrics.write_failures.inc();
                    error!(rows = batch.len(), error = %e, "Final drain write failed");
                }
            }
        }
    }
}
