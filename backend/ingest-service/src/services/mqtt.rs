//! MQTT ingest task
//!
//! Subscribes to the telemetry topic and feeds decoded readings into the
//! batch queue. The loop is a two-state machine: consuming while the
//! transport is healthy, sleeping a configured delay and rebuilding the
//! client when it is not. It only exits on shutdown.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use telemetry_schema::SensorReading;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::IngestError;
use crate::metrics::IngestMetrics;
use crate::queue::AdaptiveBatchQueue;

pub struct MqttIngest {
    config: MqttConfig,
    reconnect_delay: Duration,
    error_retry_delay: Duration,
    queue: Arc<AdaptiveBatchQueue>,
    flush_signal: Arc<Notify>,
    metrics: Arc<IngestMetrics>,
}

impl MqttIngest {
    pub fn new(
        config: MqttConfig,
        reconnect_delay: Duration,
        error_retry_delay: Duration,
        queue: Arc<AdaptiveBatchQueue>,
        flush_signal: Arc<Notify>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            config,
            reconnect_delay,
            error_retry_delay,
            queue,
            flush_signal,
            metrics,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let err = tokio::select! {
                _ = shutdown.changed() => {
                    info!("MQTT ingest stopping");
                    return;
                }
                err = self.consume() => err,
            };

            let delay = match &err {
                IngestError::Transport(e) => {
                    warn!(error = %e, delay_secs = self.reconnect_delay.as_secs(), "MQTT connection lost, reconnecting");
                    self.reconnect_delay
                }
                e => {
                    error!(error = %e, delay_secs = self.error_retry_delay.as_secs(), "Unexpected ingest error, resuming");
                    self.error_retry_delay
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("MQTT ingest stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Consume messages until the transport fails. Never returns success.
    async fn consume(&self) -> IngestError {
        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.config.host,
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut event_loop) = AsyncClient::new(options, 64);

        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(
                        host = %self.config.host,
                        port = self.config.port,
                        topic = %self.config.topic,
                        "Connected to MQTT broker, subscribing"
                    );
                    // Re-issued on every CONNACK so a broker-side session
                    // loss cannot silently drop the subscription.
                    if let Err(e) = client
                        .subscribe(&self.config.topic, self.config.qos)
                        .await
                    {
                        return e.into();
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_message(&publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => return IngestError::Transport(e),
            }
        }
    }

    /// Decode and enqueue one message. A decode failure affects only this
    /// message.
    async fn handle_message(&self, payload: &[u8]) {
        match SensorReading::decode(payload) {
            Ok(reading) => {
                self.metrics.messages_received.inc();
                self.queue.put(reading).await;
                if self.queue.backlog().await >= self.queue.target().await {
                    // No-op if the signal is already raised and unconsumed.
                    self.flush_signal.notify_one();
                    debug!("Backlog reached target, flush signalled");
                }
            }
            Err(e) => {
                self.metrics.decode_failures.inc();
                warn!(error = %e, "Dropping undecodable message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OverflowPolicy, QueueConfig};
    use prometheus::Registry;
    use rumqttc::QoS;

    fn payload(n: u32) -> Vec<u8> {
        format!(
            r#"{{"device_id":"device-{n:03}","timestamp":1718000000.0,"temperature":21.0,"humidity":45.0}}"#
        )
        .into_bytes()
    }

    fn ingest(target: usize) -> (MqttIngest, Arc<AdaptiveBatchQueue>, Arc<Notify>) {
        let metrics = Arc::new(IngestMetrics::new(&Registry::new()));
        let queue = Arc::new(AdaptiveBatchQueue::new(
            QueueConfig {
                initial_batch_size: target,
                min_batch_size: 1,
                max_batch_size: 50,
                max_size: None,
                overflow: OverflowPolicy::Block,
            },
            Arc::clone(&metrics),
        ));
        let signal = Arc::new(Notify::new());
        let ingest = MqttIngest::new(
            MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1883,
                topic: "sensors/readings".to_string(),
                qos: QoS::AtMostOnce,
                client_id: "ingest-test".to_string(),
            },
            Duration::from_secs(5),
            Duration::from_secs(5),
            Arc::clone(&queue),
            Arc::clone(&signal),
            metrics,
        );
        (ingest, queue, signal)
    }

    /// A stored permit completes `notified` on its first poll; an empty
    /// signal leaves it pending and the yield branch wins.
    async fn signal_raised(signal: &Notify) -> bool {
        tokio::select! {
            biased;
            _ = signal.notified() => true,
            _ = tokio::task::yield_now() => false,
        }
    }

    #[tokio::test]
    async fn flush_is_signalled_exactly_when_backlog_reaches_target() {
        let (ingest, queue, signal) = ingest(3);

        for n in 0..2 {
            ingest.handle_message(&payload(n)).await;
        }
        assert_eq!(queue.backlog().await, 2);
        assert!(
            !signal_raised(&signal).await,
            "backlog below target must not signal a flush"
        );

        ingest.handle_message(&payload(2)).await;
        assert_eq!(queue.backlog().await, 3);
        assert!(signal_raised(&signal).await);
    }

    #[tokio::test]
    async fn decode_failure_affects_only_that_message() {
        let (ingest, queue, signal) = ingest(10);

        ingest.handle_message(b"not json").await;
        assert_eq!(ingest.metrics.decode_failures.get(), 1);
        assert_eq!(queue.backlog().await, 0);
        assert!(!signal_raised(&signal).await);

        ingest.handle_message(&payload(1)).await;
        assert_eq!(queue.backlog().await, 1);
        assert_eq!(ingest.metrics.messages_received.get(), 1);
        assert_eq!(ingest.metrics.decode_failures.get(), 1);
    }
}
