//! Redis Streams source with consumer-group semantics
//!
//! Each entry is delivered to exactly one consumer in the group until it is
//! acknowledged; unacknowledged entries are redelivered, which is what gives
//! the relay its at-least-once guarantee.

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{aio::ConnectionManager, AsyncCommands, RedisError};
use tracing::{debug, info};

use crate::error::Result;
use crate::services::worker::{StreamEntry, StreamSource};

/// Field under which producers store the serialized reading
const PAYLOAD_FIELD: &str = "data";

pub struct RedisStreamSource {
    conn: ConnectionManager,
    stream: String,
    group: String,
}

impl RedisStreamSource {
    pub async fn connect(url: &str, stream: &str, group: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!(stream, group, "Connected to Redis");
        Ok(Self {
            conn,
            stream: stream.to_string(),
            group: group.to_string(),
        })
    }

    /// Create the consumer group, starting from the beginning of the
    /// stream. Idempotent: an already-existing group is success.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<String, RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(_) => {
                info!(stream = %self.stream, group = %self.group, "Consumer group created");
                Ok(())
            }
            Err(e) if is_busygroup(&e) => {
                info!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_busygroup(e: &RedisError) -> bool {
    e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP")
}

#[async_trait]
impl StreamSource for RedisStreamSource {
    async fn read_batch(
        &self,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count)
            .block(block_ms);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let payload = id
                    .map
                    .get(PAYLOAD_FIELD)
                    .and_then(|v| redis::from_redis_value::<String>(v).ok());
                entries.push(StreamEntry {
                    id: id.id,
                    payload,
                });
            }
        }
        debug!(consumer, entries = entries.len(), "Read from stream");
        Ok(entries)
    }

    async fn ack(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let acked: i64 = conn.xack(&self.stream, &self.group, ids).await?;
        debug!(acked, "Acknowledged stream entries");
        Ok(())
    }
}
