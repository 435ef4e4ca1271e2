//! PostgreSQL pool setup shared by the job, canonical and index stores.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use agential_core::defaults::{
    DB_ACQUIRE_TIMEOUT_SECS, DB_IDLE_TIMEOUT_SECS, DB_MAX_CONNECTIONS, DB_MIN_CONNECTIONS,
};
use agential_core::{Error, Result};

/// Connections recycle after this long regardless of activity.
const MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Bound on waiting for a free connection; a worker blocked longer fails
    /// its store write as retryable.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DB_MAX_CONNECTIONS,
            min_connections: DB_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DB_IDLE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Read `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS`,
    /// `DB_ACQUIRE_TIMEOUT_SECS` and `DB_IDLE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        let config = Self {
            max_connections: var("DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS).max(1),
            min_connections: var("DB_MIN_CONNECTIONS", DB_MIN_CONNECTIONS),
            acquire_timeout: Duration::from_secs(var(
                "DB_ACQUIRE_TIMEOUT_SECS",
                DB_ACQUIRE_TIMEOUT_SECS,
            )),
            idle_timeout: Duration::from_secs(var("DB_IDLE_TIMEOUT_SECS", DB_IDLE_TIMEOUT_SECS)),
        };
        config.clamped()
    }

    /// Keep `min_connections <= max_connections`.
    fn clamped(mut self) -> Self {
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }
}

/// Connect with default settings.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let config = config.clamped();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(MAX_LIFETIME)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}
