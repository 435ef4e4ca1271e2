//! Store selection: PostgreSQL when `DATABASE_URL` is set, in-memory otherwise.

use std::sync::Arc;

use agential_core::{CanonicalStore, JobStore, LexicalStore, VectorStore};
use agential_db::{Database, MemoryCanonicalStore, MemoryJobStore};
use agential_search::{MemoryLexicalStore, MemoryVectorStore, PgLexicalStore, PgVectorStore};
use tracing::{info, warn};

/// The four stores every component is built over.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub canonical: Arc<dyn CanonicalStore>,
    pub lexical: Arc<dyn LexicalStore>,
    pub vector: Arc<dyn VectorStore>,
    pub backend: &'static str,
}

impl Stores {
    pub async fn from_env() -> anyhow::Result<Self> {
        match std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()) {
            Some(url) => Self::postgres(&url).await,
            None => {
                warn!(
                    subsystem = "daemon",
                    "DATABASE_URL not set, using in-memory stores (state is lost on exit)"
                );
                Ok(Self::memory())
            }
        }
    }

    pub async fn postgres(url: &str) -> anyhow::Result<Self> {
        let db = Database::connect_from_env(url).await?;
        db.migrate().await?;
        info!(subsystem = "daemon", "Database migrations applied");
        Ok(Self {
            jobs: Arc::new(db.jobs.clone()),
            canonical: Arc::new(db.canonical.clone()),
            lexical: Arc::new(PgLexicalStore::new(db.pool.clone())),
            vector: Arc::new(PgVectorStore::new(db.pool.clone())),
            backend: "postgres",
        })
    }

    pub fn memory() -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            canonical: Arc::new(MemoryCanonicalStore::new()),
            lexical: Arc::new(MemoryLexicalStore::new()),
            vector: Arc::new(MemoryVectorStore::new()),
            backend: "memory",
        }
    }
}
