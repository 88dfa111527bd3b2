//! Prometheus metrics for the ingest pipeline
//!
//! Constructed once at process start from an injected registry and passed
//! into each component; no global metric state.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

#[derive(Clone)]
pub struct IngestMetrics {
    pub messages_received: IntCounter,
    pub decode_failures: IntCounter,
    pub queue_size: IntGauge,
    pub queue_dropped: IntCounter,
    pub batch_target: IntGauge,
    pub queue_wait_seconds: Histogram,
    pub batches_written: IntCounter,
    pub rows_written: IntCounter,
    pub write_failures: IntCounter,
}

impl IngestMetrics {
    pub fn new(registry: &Registry) -> Self {
        let messages_received = IntCounter::new(
            "mqtt_messages_received_total",
            "Messages received from the MQTT broker",
        )
        .expect("valid metric for mqtt_messages_received_total");
        let decode_failures = IntCounter::new(
            "mqtt_decode_failures_total",
            "Inbound messages dropped because they failed to decode",
        )
        .expect("valid metric for mqtt_decode_failures_total");
        let queue_size = IntGauge::new("ingest_queue_size", "Readings currently buffered")
            .expect("valid metric for ingest_queue_size");
        let queue_dropped = IntCounter::new(
            "ingest_queue_dropped_total",
            "Readings dropped because the queue was at capacity",
        )
        .expect("valid metric for ingest_queue_dropped_total");
        let batch_target = IntGauge::new(
            "ingest_batch_target_size",
            "Current adaptive target batch size",
        )
        .expect("valid metric for ingest_batch_target_size");
        let queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ingest_queue_wait_seconds",
                "Time a reading spent buffered before being drained",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )
        .expect("valid metric for ingest_queue_wait_seconds");
        let batches_written = IntCounter::new(
            "db_batches_written_total",
            "Batches successfully written to PostgreSQL",
        )
        .expect("valid metric for db_batches_written_total");
        let rows_written = IntCounter::new(
            "db_rows_written_total",
            "Rows successfully written to PostgreSQL",
        )
        .expect("valid metric for db_rows_written_total");
        let write_failures = IntCounter::new(
            "db_write_failures_total",
            "Batch writes that failed; the batch is discarded",
        )
        .expect("valid metric for db_write_failures_total");

        for metric in [
            Box::new(messages_received.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(decode_failures.clone()),
            Box::new(queue_size.clone()),
            Box::new(queue_dropped.clone()),
            Box::new(batch_target.clone()),
            Box::new(queue_wait_seconds.clone()),
            Box::new(batches_written.clone()),
            Box::new(rows_written.clone()),
            Box::new(write_failures.clone()),
        ] {
            registry
                .register(metric)
                .expect("metric registered once at startup");
        }

        Self {
            messages_received,
            decode_failures,
            queue_size,
            queue_dropped,
            batch_target,
            queue_wait_seconds,
            batches_written,
            rows_written,
            write_failures,
        }
    }
}
