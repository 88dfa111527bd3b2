//! PostgreSQL sink for relayed batches.

use std::sync::Arc;

use async_trait::async_trait;
use db_pool::PgConnectionManager;
use sqlx::{Postgres, QueryBuilder};
use telemetry_schema::SensorReading;

use crate::error::{RelayError, Result};

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
        query.build().execute(&pool).await.map_err(RelayError::from)?;
        Ok(())
    }
}
