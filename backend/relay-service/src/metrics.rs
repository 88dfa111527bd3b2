//! Prometheus metrics for the relay worker, injected at process start.

use prometheus::{IntCounter, Registry};

#[derive(Clone)]
pub struct RelayMetrics {
    pub entries_read: IntCounter,
    pub batches_dropped: IntCounter,
    pub rows_written: IntCounter,
    pub write_failures: IntCounter,
    pub acks_issued: IntCounter,
}

impl RelayMetrics {
    pub fn new(registry: &Registry) -> Self {
        let entries_read = IntCounter::new(
            "stream_entries_read_total",
            "Entries fetched from the Redis stream",
        )
        .expect("valid metric for stream_entries_read_total");
        let batches_dropped = IntCounter::new(
            "stream_batches_dropped_total",
            "Fetched batches dropped because an entry failed to decode",
        )
        .expect("valid metric for stream_batches_dropped_total");
        let rows_written = IntCounter::new(
            "db_rows_written_total",
            "Rows successfully written to PostgreSQL",
        )
        .expect("valid metric for db_rows_written_total");
        let write_failures = IntCounter::new(
            "db_write_failures_total",
            "Batch writes that failed; entries stay unacknowledged",
        )
        .expect("valid metric for db_write_failures_total");
        let acks_issued = IntCounter::new(
            "stream_acks_issued_total",
            "Entries acknowledged after a durable write",
        )
        .expect("valid metric for stream_acks_issued_total");

        for metric in [
            Box::new(entries_read.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(batches_dropped.clone()),
            Box::new(rows_written.clone()),
            Box::new(write_failures.clone()),
            Box::new(acks_issued.clone()),
        ] {
            registry
                .register(metric)
                .expect("metric registered once at startup");
        }

        Self {
            entries_read,
            batches_dropped,
            rows_written,
            write_failures,
            acks_issued,
        }
    }
}
