//! Database connection pool management
//!
//! Provides a generic connection manager with an explicit retry policy and
//! the concrete PostgreSQL pool connector used by both services. Connection
//! establishment is serialized: while one attempt is outstanding, concurrent
//! callers wait on it instead of starting their own.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Retry policy for connection establishment
///
/// `max_retries = 0` means retry forever; otherwise the manager gives up
/// with [`PoolError::Exhausted`] after that many failed attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection attempts exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },
}

/// Connection factory seam, implemented by [`PgConnector`] in production and
/// by scripted connectors in tests.
#[async_trait]
pub trait Connect: Send + Sync {
    type Conn: Clone + Send + Sync;

    async fn connect(&self) -> Result<Self::Conn, BoxError>;

    /// Tear down an established connection. Default is a no-op for handle
    /// types that clean up on drop.
    async fn disconnect(&self, _conn: Self::Conn) {}
}

/// Owns at most one established connection handle and re-creates it on
/// demand according to the retry policy.
pub struct ConnectionManager<C: Connect> {
    connector: C,
    policy: RetryPolicy,
    // Holding this lock across connect + sleep is what serializes
    // concurrent callers onto a single outstanding attempt.
    slot: Mutex<Option<C::Conn>>,
    failed_attempts: AtomicU32,
}

impl<C: Connect> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            slot: Mutex::new(None),
            failed_attempts: AtomicU32::new(0),
        }
    }

    /// Return a usable connection handle, establishing one if necessary.
    ///
    /// Blocks until a connection is available or the retry policy is
    /// exhausted. Callers that race on a cold manager all wait on the same
    /// attempt.
    pub async fn acquire(&self) -> Result<C::Conn, PoolError> {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let mut attempts = 0u32;
        loop {
            match self.connector.connect().await {
                Ok(conn) => {
                    if attempts > 0 {
                        info!(attempts, "Connection established after retries");
                    }
                    self.failed_attempts.store(attempts, Ordering::Relaxed);
                    *slot = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    attempts += 1;
                    self.failed_attempts.store(attempts, Ordering::Relaxed);
                    if self.policy.max_retries != 0 && attempts >= self.policy.max_retries {
                        error!(
                            attempts,
                            error = %e,
                            "Giving up on connection establishment"
                        );
                        return Err(PoolError::Exhausted {
                            attempts,
                            source: e,
                        });
                    }
                    warn!(
                        attempt = attempts,
                        delay_ms = self.policy.retry_delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
            }
        }
    }

    /// Number of failed attempts preceding the most recent acquire outcome.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Tear down the current connection, if any. The next `acquire` will
    /// establish a fresh one.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.take() {
            self.connector.disconnect(conn).await;
            info!("Connection closed");
        }
    }
}

/// PostgreSQL pool configuration
#[derive(Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("database_url", &"[REDACTED]")
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_secs", &self.retry_delay_secs)
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            min_connections: 1,
            max_connections: 5,
            acquire_timeout_secs: 10,
            max_retries: 5,
            retry_delay_secs: 3,
        }
    }
}

impl DbConfig {
    /// Read pool settings from the environment. `DATABASE_URL` is mandatory,
    /// everything else has defaults.
    pub fn from_env() -> Result<Self, PoolError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| {
            PoolError::Config("DATABASE_URL environment variable not set".to_string())
        })?;

        Ok(Self {
            database_url,
            min_connections: env_or("DB_POOL_MIN_SIZE", 1),
            max_connections: env_or("DB_POOL_MAX_SIZE", 5),
            acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", 10),
            max_retries: env_or("DB_MAX_RETRIES", 5),
            retry_delay_secs: env_or("DB_RETRY_DELAY_SECS", 3),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Connection factory for a sqlx PostgreSQL pool
pub struct PgConnector {
    config: DbConfig,
}

impl PgConnector {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connect for PgConnector {
    type Conn = PgPool;

    async fn connect(&self) -> Result<PgPool, BoxError> {
        info!(
            max_connections = self.config.max_connections,
            "Connecting to PostgreSQL"
        );
        let pool = PgPoolOptions::new()
            .min_connections(self.config.min_connections)
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(self.config.acquire_timeout_secs))
            .connect(&self.config.database_url)
            .await?;
        Ok(pool)
    }

    async fn disconnect(&self, conn: PgPool) {
        conn.close().await;
    }
}

pub type PgConnectionManager = ConnectionManager<PgConnector>;

/// Build a connection manager for PostgreSQL from the given config.
pub fn pg_manager(config: DbConfig) -> PgConnectionManager {
    let policy = config.retry_policy();
    ConnectionManager::new(PgConnector::new(config), policy)
}
