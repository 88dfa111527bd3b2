use std::env;
use std::time::Duration;

use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub stream: String,
    pub group: String,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer names within the group; one worker task is spawned per name
    pub consumers: Vec<String>,
    /// Maximum entries fetched per poll
    pub batch_size: usize,
    /// XREADGROUP block timeout; bounds how long a poll can sit idle
    pub block_ms: usize,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub db: db_pool::DbConfig,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, RelayError> {
        let redis = RedisConfig {
            url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            stream: env::var("REDIS_STREAM").unwrap_or_else(|_| "sensor-readings".into()),
            group: env::var("REDIS_GROUP").unwrap_or_else(|_| "pg-relay".into()),
        };

        let db = db_pool::DbConfig::from_env()?;

        let consumers: Vec<String> = env::var("RELAY_CONSUMERS")
            .unwrap_or_else(|_| "worker-1".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if consumers.is_empty() {
            return Err(RelayError::Config(
                "RELAY_CONSUMERS must name at least one consumer".into(),
            ));
        }

        let worker = WorkerConfig {
            consumers,
            batch_size: parse_or("RELAY_BATCH_SIZE", 100),
            block_ms: parse_or("RELAY_BLOCK_MS", 1000),
            retry_delay: Duration::from_secs(parse_or("RELAY_RETRY_DELAY_SECS", 2)),
        };

        Ok(Self { redis, db, worker })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_list_splits_and_trims() {
        let consumers: Vec<String> = "worker-1, worker-2 ,,worker-3"
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(consumers, vec!["worker-1", "worker-2", "worker-3"]);
    }
}
