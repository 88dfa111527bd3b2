//! Adaptive batch queue between the MQTT ingest task and the flush task
//!
//! FIFO buffer of timestamp-tagged readings. The drain side removes at most
//! `target` items per call and recomputes the target from backlog pressure:
//! doubled while the backlog runs more than twice ahead of it, halved when
//! the backlog falls below half of it, always clamped to the configured
//! bounds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use telemetry_schema::SensorReading;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::metrics::IngestMetrics;

/// What `put` does when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Suspend the producer until the flush task frees space
    Block,
    /// Drop the new item and count it
    Drop,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub initial_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub max_size: Option<usize>,
    pub overflow: OverflowPolicy,
}

struct Enqueued {
    reading: SensorReading,
    enqueued_at: Instant,
}

struct Inner {
    items: VecDeque<Enqueued>,
    target: usize,
}

pub struct AdaptiveBatchQueue {
    inner: Mutex<Inner>,
    not_full: Notify,
    config: QueueConfig,
    metrics: Arc<IngestMetrics>,
}

impl AdaptiveBatchQueue {
    pub fn new(config: QueueConfig, metrics: Arc<IngestMetrics>) -> Self {
        let target = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        metrics.batch_target.set(target as i64);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                target,
            }),
            not_full: Notify::new(),
            config,
            metrics,
        }
    }

    /// Append a reading, tagged with its enqueue time.
    ///
    /// Only suspends under `OverflowPolicy::Block` with a full queue.
    pub async fn put(&self, reading: SensorReading) {
        loop {
            let mut inner = self.inner.lock().await;
            if let Some(max) = self.config.max_size {
                if inner.items.len() >= max {
                    match self.config.overflow {
                        OverflowPolicy::Drop => {
                            self.metrics.queue_dropped.inc();
                            debug!(capacity = max, "Queue full, dropping reading");
                            return;
                        }
                        OverflowPolicy::Block => {
                            drop(inner);
                            self.not_full.notified().await;
                            continue;
                        }
                    }
                }
            }
            inner.items.push_back(Enqueued {
                reading,
                enqueued_at: Instant::now(),
            });
            self.metrics.queue_size.set(inner.items.len() as i64);
            return;
        }
    }

    /// Remove and return at most `target` readings, oldest first, then
    /// recompute the target from the remaining backlog.
    pub async fn get_batch(&self) -> Vec<SensorReading> {
        let mut inner = self.inner.lock().await;
        let take = inner.target.min(inner.items.len());
        let now = Instant::now();
        let mut batch = Vec::with_capacity(take);
        while batch.len() < take {
            match inner.items.pop_front() {
                Some(entry) => {
                    self.metrics
                        .queue_wait_seconds
                        .observe(now.duration_since(entry.enqueued_at).as_secs_f64());
                    batch.push(entry.reading);
                }
                None => break,
            }
        }

        let backlog = inner.items.len();
        if backlog > inner.target * 2 {
            inner.target = (inner.target * 2).min(self.config.max_batch_size);
        } else if backlog < inner.target / 2 {
            inner.target = (inner.target / 2).max(self.config.min_batch_size);
        }

        self.metrics.queue_size.set(backlog as i64);
        self.metrics.batch_target.set(inner.target as i64);
        if !batch.is_empty() {
            self.not_full.notify_one();
        }
        batch
    }

    /// Number of buffered readings.
    pub async fn backlog(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    /// Current adaptive target batch size.
    pub async fn target(&self) -> usize {
        self.inner.lock().await.target
    }
}
