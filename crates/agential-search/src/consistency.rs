//! Dual-store consistency manager.
//!
//! An upsert runs the lexical and vector writes as two independent steps.
//! Each step skips its write when the store already holds the incoming hash,
//! and each confirmed write is recorded against the canonical record before
//! the step counts as done. One side failing leaves an explicit partial
//! state that the owning job retries until both sides agree.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use agential_core::defaults::STORE_WRITE_TIMEOUT_SECS;
use agential_core::{
    CanonicalId, CanonicalStore, ContentHash, Embedder, Error, IndexDocument, LexicalStore,
    Result, StoreSide, UpsertResult, VectorStore,
};

/// Consistency manager settings.
#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    /// Bound on each store write (and the embedding call that feeds it).
    pub write_timeout: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(STORE_WRITE_TIMEOUT_SECS),
        }
    }
}

impl ConsistencyConfig {
    /// Read `STORE_WRITE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let write_timeout = std::env::var("STORE_WRITE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Self::default().write_timeout);
        Self { write_timeout }
    }
}

/// Keeps the lexical and vector stores coherent under one canonical id.
pub struct ConsistencyManager {
    canonical: Arc<dyn CanonicalStore>,
    lexical: Arc<dyn LexicalStore>,
    vector: Arc<dyn VectorStore>,
    embedder: Option<Arc<dyn Embedder>>,
    config: ConsistencyConfig,
}

impl ConsistencyManager {
    pub fn new(
        canonical: Arc<dyn CanonicalStore>,
        lexical: Arc<dyn LexicalStore>,
        vector: Arc<dyn VectorStore>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            canonical,
            lexical,
            vector,
            embedder: None,
            config,
        }
    }

    /// Embedder used when a document arrives without a precomputed embedding.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn canonical(&self) -> &Arc<dyn CanonicalStore> {
        &self.canonical
    }

    pub fn lexical(&self) -> &Arc<dyn LexicalStore> {
        &self.lexical
    }

    pub fn vector(&self) -> &Arc<dyn VectorStore> {
        &self.vector
    }

    /// Write `doc` under `canonical_id` to both stores, tagged with `hash`.
    ///
    /// Returns `AlreadyCurrent` when both sides already reflect `hash`,
    /// `Applied` once both do, and `Partial` when exactly one step failed
    /// with a retryable error. Both steps failing is `Error::Retryable`; a
    /// non-retryable step error (bad payload, no embedder) is returned as is.
    #[instrument(skip(self, doc), fields(subsystem = "search", component = "consistency", op = "upsert", canonical_id = %canonical_id, content_hash = hash.short()))]
    pub async fn upsert(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        hash: &ContentHash,
    ) -> Result<UpsertResult> {
        let start = Instant::now();
        let record = self.canonical.get(canonical_id).await?;
        let lexical_current = record
            .as_ref()
            .is_some_and(|r| r.side_is_current(StoreSide::Lexical, hash));
        let vector_current = record
            .as_ref()
            .is_some_and(|r| r.side_is_current(StoreSide::Vector, hash));

        if lexical_current && vector_current {
            debug!("Both stores already current, skipping");
            return Ok(UpsertResult::AlreadyCurrent);
        }

        let (lexical, vector) = tokio::join!(
            async {
                if lexical_current {
                    Ok(())
                } else {
                    self.lexical_step(canonical_id, doc, hash).await
                }
            },
            async {
                if vector_current {
                    Ok(())
                } else {
                    self.vector_step(canonical_id, doc, hash).await
                }
            }
        );

        let result = match (lexical, vector) {
            (Ok(()), Ok(())) => UpsertResult::Applied,
            (Err(e), _) | (_, Err(e)) if !e.is_retryable() => return Err(e),
            (Err(e), Ok(())) => UpsertResult::Partial {
                applied: StoreSide::Vector,
                failed: StoreSide::Lexical,
                error: e.to_string(),
            },
            (Ok(()), Err(e)) => UpsertResult::Partial {
                applied: StoreSide::Lexical,
                failed: StoreSide::Vector,
                error: e.to_string(),
            },
            (Err(lexical), Err(vector)) => {
                warn!(
                    lexical_error = %lexical,
                    vector_error = %vector,
                    "Both store writes failed"
                );
                return Err(Error::Retryable(format!(
                    "both store writes failed for {}: lexical: {}; vector: {}",
                    canonical_id, lexical, vector
                )));
            }
        };

        match &result {
            UpsertResult::Partial {
                applied,
                failed,
                error,
            } => warn!(
                applied = %applied,
                failed = %failed,
                error = %error,
                duration_ms = start.elapsed().as_millis() as u64,
                "Partial upsert, retry required"
            ),
            _ => info!(
                duration_ms = start.elapsed().as_millis() as u64,
                "Upsert applied"
            ),
        }
        Ok(result)
    }

    async fn lexical_step(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        hash: &ContentHash,
    ) -> Result<()> {
        let stored = self.lexical.stored_hash(canonical_id).await?;
        if stored.as_ref() != Some(hash) {
            self.bounded("lexical write", self.lexical.write(canonical_id, doc, hash))
                .await?;
        } else {
            debug!(side = "lexical", "Store already holds hash, recording only");
        }
        self.canonical
            .record_write(canonical_id, StoreSide::Lexical, hash)
            .await?;
        Ok(())
    }

    async fn vector_step(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        hash: &ContentHash,
    ) -> Result<()> {
        let stored = self.vector.stored_hash(canonical_id).await?;
        if stored.as_ref() != Some(hash) {
            let embedding = match &doc.embedding {
                Some(embedding) => embedding.clone(),
                None => {
                    let embedder = self.embedder.as_ref().ok_or_else(|| {
                        Error::Fatal(format!(
                            "no embedder configured and {} carries no embedding",
                            canonical_id
                        ))
                    })?;
                    let text = doc.indexable_text();
                    self.bounded("embedding", embedder.embed(&text)).await?
                }
            };
            self.bounded(
                "vector write",
                self.vector.write(canonical_id, doc, &embedding, hash),
            )
            .await?;
        } else {
            debug!(side = "vector", "Store already holds hash, recording only");
        }
        self.canonical
            .record_write(canonical_id, StoreSide::Vector, hash)
            .await?;
        Ok(())
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.write_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} exceeded {:?}",
                what, self.config.write_timeout
            ))),
        }
    }
}
