//! # agential-db
//!
//! Job and canonical-record persistence for the orchestration core.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL `JobStore` and `CanonicalStore` implementations
//! - In-memory implementations for single-process runs and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use agential_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> agential_db::Result<()> {
//!     let db = Database::connect("postgres://localhost/agential").await?;
//!     db.migrate().await?;
//!     let pending = db.jobs.list_by_state(agential_db::JobState::Pending, 100).await?;
//!     println!("{} pending jobs", pending.len());
//!     Ok(())
//! }
//! ```

pub mod canonical;
pub mod jobs;
pub mod memory;
pub mod pool;

// Re-export core types
pub use agential_core::*;

pub use canonical::PgCanonicalStore;
pub use jobs::PgJobStore;
pub use memory::{MemoryCanonicalStore, MemoryJobStore};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};

/// Combined database context with both stores.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job store for the scheduler and workers.
    pub jobs: PgJobStore,
    /// Canonical-record store for the consistency manager.
    pub canonical: PgCanonicalStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobStore::new(pool.clone()),
            canonical: PgCanonicalStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Connect with pool settings read from the environment.
    pub async fn connect_from_env(url: &str) -> Result<Self> {
        let pool = create_pool_with_config(url, PoolConfig::from_env()).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
