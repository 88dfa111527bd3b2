//! Stream consumer worker: poll, decode, write, acknowledge
//!
//! Acknowledgements are only issued after the sink write succeeds, so a
//! write failure leaves the entries pending in the group and the log
//! redelivers them on a later poll. A decode failure anywhere in a fetched
//! batch drops the whole batch without acknowledgement.

use std::sync::Arc;

use async_trait::async_trait;
use telemetry_schema::{DecodeError, SensorReading};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::metrics::RelayMetrics;
use crate::services::sink::BatchSink;

/// One entry as fetched from the partitioned log. The payload is `None`
/// when the entry lacks the expected field; the worker treats that as a
/// decode failure.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Option<String>,
}

/// Consumer-group view of the partitioned log.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn read_batch(
        &self,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamEntry>>;

    async fn ack(&self, ids: &[String]) -> Result<()>;
}

pub struct StreamWorker {
    name: String,
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn BatchSink>,
    config: WorkerConfig,
    metrics: Arc<RelayMetrics>,
}

impl StreamWorker {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn BatchSink>,
        config: WorkerConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            sink,
            config,
            metrics,
        }
    }

    /// Run until the shutdown signal fires. The poll block timeout bounds
    /// how long a quiet stream can delay shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "Stream worker started");
        loop {
            let entries = tokio::select! {
                _ = shutdown.changed() => break,
                fetched = self.source.read_batch(
                    &self.name,
                    self.config.batch_size,
                    self.config.block_ms,
                ) => match fetched {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(worker = %self.name, error = %e, "Stream read failed");
                        if !self.sleep_retry(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            if entries.is_empty() {
                continue;
            }
            self.metrics.entries_read.inc_by(entries.len() as u64);

            let (batch, ids) = match decode_batch(&entries) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.metrics.batches_dropped.inc();
                    warn!(
                        worker = %self.name,
                        entries = entries.len(),
                        error = %e,
                        "Dropping batch with undecodable entry"
                    );
                    continue;
                }
            };

            if let Err(e) = self.sink.write(&batch).await {
                self.metrics.write_failures.inc();
                error!(
                    worker = %self.name,
                    rows = batch.len(),
                    error = %e,
                    "Batch write failed, entries stay unacknowledged"
                );
                if !self.sleep_retry(&mut shutdown).await {
                    break;
                }
                continue;
            }
            self.metrics.rows_written.inc_by(batch.len() as u64);

            match self.source.ack(&ids).await {
                Ok(()) => {
                    self.metrics.acks_issued.inc_by(ids.len() as u64);
                    debug!(worker = %self.name, rows = batch.len(), "Batch written and acknowledged");
                }
                Err(e) => {
                    // The write is durable; redelivered entries become
                    // duplicate rows, which at-least-once permits.
                    error!(worker = %self.name, error = %e, "Ack failed, entries will be redelivered");
                }
            }
        }
        info!(worker = %self.name, "Stream worker stopped");
    }

    /// Returns false when shutdown fired during the backoff.
    async fn sleep_retry(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(self.config.retry_delay) => true,
        }
    }
}

/// Decode every entry or fail the whole batch on the first bad one.
fn decode_batch(
    entries: &[StreamEntry],
) -> std::result::Result<(Vec<SensorReading>, Vec<String>), DecodeError> {
    let mut batch = Vec::with_capacity(entries.len());
    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let payload = entry
            .payload
            .as_deref()
            .ok_or(DecodeError::MissingField("data"))?;
        batch.push(SensorReading::decode_str(payload)?);
        ids.push(entry.id.clone());
    }
    Ok((batch, ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use prometheus::Registry;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn payload(n: u32) -> String {
        format!(
            r#"{{"device_id":"device-{n:03}","timestamp":1718000000.0,"temperature":21.0,"humidity":45.0}}"#
        )
    }

    fn entry(id: &str, payload: String) -> StreamEntry {
        StreamEntry {
            id: id.to_string(),
            payload: Some(payload),
        }
    }

    /// Source that serves scripted read results, then blocks-and-returns
    /// empty like a quiet stream.
    struct ScriptedSource {
        reads: Mutex<VecDeque<Result<Vec<StreamEntry>>>>,
        acks: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedSource {
        fn new(reads: Vec<Result<Vec<StreamEntry>>>) -> Self {
            Self {
                reads: Mutex::new(reads.into()),
                acks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        async fn read_batch(
            &self,
            _consumer: &str,
            _count: usize,
            block_ms: usize,
        ) -> Result<Vec<StreamEntry>> {
            if let Some(next) = self.reads.lock().await.pop_front() {
                return next;
            }
            tokio::time::sleep(Duration::from_millis(block_ms as u64)).await;
            Ok(Vec::new())
        }

        async fn ack(&self, ids: &[String]) -> Result<()> {
            self.acks.lock().await.push(ids.to_vec());
            Ok(())
        }
    }

    struct RecordingSink {
        written: Mutex<Vec<Vec<SensorReading>>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Self {
            Self {
                written: Mutex::new(Vec::new()),
                fail: AtomicBool::new(fail),
            }
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn write(&self, batch: &[SensorReading]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RelayError::Database(sqlx::Error::PoolClosed));
            }
            self.written.lock().await.push(batch.to_vec());
            Ok(())
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            consumers: vec!["worker-1".into()],
            batch_size: 100,
            block_ms: 1000,
            retry_delay: Duration::from_millis(100),
        }
    }

    async fn run_worker(
        source: Arc<ScriptedSource>,
        sink: Arc<RecordingSink>,
    ) -> Arc<RelayMetrics> {
        let metrics = Arc::new(RelayMetrics::new(&Registry::new()));
        let worker = Arc::new(StreamWorker::new(
            "worker-1",
            Arc::clone(&source) as Arc<dyn StreamSource>,
            Arc::clone(&sink) as Arc<dyn BatchSink>,
            worker_config(),
            Arc::clone(&metrics),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(shutdown_rx).await })
        };
        // A few block timeouts worth of virtual time lets the worker chew
        // through every scripted read.
        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown_tx.send(true).expect("worker is alive");
        task.await.expect("worker task");
        metrics
    }

    #[tokio::test(start_paused = true)]
    async fn successful_batch_is_written_then_acked() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            entry("1-0", payload(1)),
            entry("1-1", payload(2)),
            entry("1-2", payload(3)),
        ])]));
        let sink = Arc::new(RecordingSink::new(false));

        let metrics = run_worker(Arc::clone(&source), Arc::clone(&sink)).await;

        let written = sink.written.lock().await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].len(), 3);
        let acks = source.acks.lock().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0], vec!["1-0", "1-1", "1-2"]);
        assert_eq!(metrics.acks_issued.get(), 3);
        assert_eq!(metrics.rows_written.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_issues_no_acks() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            entry("1-0", payload(1)),
            entry("1-1", payload(2)),
        ])]));
        let sink = Arc::new(RecordingSink::new(true));

        let metrics = run_worker(Arc::clone(&source), Arc::clone(&sink)).await;

        assert!(sink.written.lock().await.is_empty());
        assert!(source.acks.lock().await.is_empty(), "no ack without a durable write");
        assert_eq!(metrics.acks_issued.get(), 0);
        assert_eq!(metrics.write_failures.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_malformed_entry_drops_the_whole_batch() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            entry("1-0", payload(1)),
            entry("1-1", payload(2)),
            entry("1-2", "not json".to_string()),
            entry("1-3", payload(3)),
            entry("1-4", payload(4)),
        ])]));
        let sink = Arc::new(RecordingSink::new(false));

        let metrics = run_worker(Arc::clone(&source), Arc::clone(&sink)).await;

        assert!(sink.written.lock().await.is_empty(), "well-formed entries must not be written");
        assert!(source.acks.lock().await.is_empty());
        assert_eq!(metrics.batches_dropped.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_payload_field_counts_as_decode_failure() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            entry("1-0", payload(1)),
            StreamEntry {
                id: "1-1".to_string(),
                payload: None,
            },
        ])]));
        let sink = Arc::new(RecordingSink::new(false));

        let metrics = run_worker(Arc::clone(&source), Arc::clone(&sink)).await;

        assert!(sink.written.lock().await.is_empty());
        assert!(source.acks.lock().await.is_empty());
        assert_eq!(metrics.batches_dropped.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_backs_off_then_recovers() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(RelayError::Database(sqlx::Error::PoolClosed)),
            Ok(vec![entry("2-0", payload(9))]),
        ]));
        let sink = Arc::new(RecordingSink::new(false));

        let metrics = run_worker(Arc::clone(&source), Arc::clone(&sink)).await;

        assert_eq!(sink.written.lock().await.len(), 1);
        assert_eq!(metrics.acks_issued.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_retried_on_redelivery() {
        // The log redelivers unacknowledged entries; after the sink heals,
        // the same batch goes through and gets acked exactly once.
        let batch = vec![entry("1-0", payload(1)), entry("1-1", payload(2))];
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(batch.clone()),
            Ok(batch.clone()),
        ]));
        let sink = Arc::new(RecordingSink::new(true));

        let metrics = Arc::new(RelayMetrics::new(&Registry::new()));
        let worker = Arc::new(StreamWorker::new(
            "worker-1",
            Arc::clone(&source) as Arc<dyn StreamSource>,
            Arc::clone(&sink) as Arc<dyn BatchSink>,
            worker_config(),
            Arc::clone(&metrics),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(shutdown_rx).await })
        };

        // First delivery fails to write; heal the sink before the retry
        // backoff elapses.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;

        shutdown_tx.send(true).expect("worker is alive");
        task.await.expect("worker task");

        assert_eq!(sink.written.lock().await.len(), 1);
        let acks = source.acks.lock().await;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0], vec!["1-0", "1-1"]);
        assert_eq!(metrics.write_failures.get(), 1);
    }
}
