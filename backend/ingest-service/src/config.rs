use std::env;
use std::time::Duration;

use rumqttc::QoS;

use crate::error::IngestError;
use crate::queue::OverflowPolicy;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub qos: QoS,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Initial batch size; the queue adapts between min and max from here
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub mqtt_reconnect_delay: Duration,
    pub error_retry_delay: Duration,
    /// Queue capacity; `None` means unbounded
    pub queue_max_size: Option<usize>,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub db: db_pool::DbConfig,
    pub subscriber: SubscriberConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, IngestError> {
        let qos_level: u8 = parse_or("MQTT_QOS", 0);
        let qos = match qos_level {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => {
                return Err(IngestError::Config(format!(
                    "MQTT_QOS must be 0, 1 or 2, got {other}"
                )))
            }
        };

        let mqtt = MqttConfig {
            host: env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: parse_or("MQTT_PORT", 1883),
            topic: env::var("MQTT_TOPIC").unwrap_or_else(|_| "sensors/readings".into()),
            qos,
            client_id: env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "ingest-service".into()),
        };

        let db = db_pool::DbConfig::from_env()?;

        let min_batch_size = parse_or("MIN_BATCH_SIZE", 5);
        let max_batch_size = parse_or("MAX_BATCH_SIZE", 200);
        let batch_size = parse_or("BATCH_SIZE", 20);
        if min_batch_size == 0 || min_batch_size > max_batch_size {
            return Err(IngestError::Config(format!(
                "Invalid batch size bounds: min={min_batch_size} max={max_batch_size}"
            )));
        }

        let queue_max_size = match parse_or::<usize>("QUEUE_MAX_SIZE", 0) {
            0 => None,
            n => Some(n),
        };

        let overflow = match env::var("QUEUE_OVERFLOW").as_deref() {
            Ok("drop") => OverflowPolicy::Drop,
            Ok("block") | Err(_) => OverflowPolicy::Block,
            Ok(other) => {
                return Err(IngestError::Config(format!(
                    "QUEUE_OVERFLOW must be 'block' or 'drop', got '{other}'"
                )))
            }
        };

        let subscriber = SubscriberConfig {
            batch_size: batch_size.clamp(min_batch_size, max_batch_size),
            min_batch_size,
            max_batch_size,
            flush_interval: Duration::from_secs(parse_or("FLUSH_INTERVAL_SECS", 5)),
            mqtt_reconnect_delay: Duration::from_secs(parse_or("MQTT_RECONNECT_DELAY_SECS", 5)),
            error_retry_delay: Duration::from_secs(parse_or("ERROR_RETRY_DELAY_SECS", 5)),
            queue_max_size,
            overflow,
        };

        Ok(Self {
            mqtt,
            db,
            subscriber,
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
