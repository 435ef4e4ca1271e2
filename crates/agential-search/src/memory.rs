//! In-memory lexical and vector stores.
//!
//! Used when no `DATABASE_URL` is configured and in tests. Both stores can be
//! told to fail writes so partial-write paths can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use agential_core::{
    CanonicalId, ContentHash, Error, IndexDocument, LexicalStore, Result, VectorStore,
};

/// Write-failure switch and counter shared by both memory stores.
#[derive(Debug, Default)]
struct FaultInjection {
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl FaultInjection {
    fn check(&self, store: &str, canonical_id: &CanonicalId) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!(
                "{} store unavailable writing {}",
                store, canonical_id
            )));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LexicalEntry {
    hash: ContentHash,
    text: String,
}

/// In-memory implementation of LexicalStore.
#[derive(Debug, Default)]
pub struct MemoryLexicalStore {
    docs: RwLock<HashMap<CanonicalId, LexicalEntry>>,
    faults: FaultInjection,
}

impl MemoryLexicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_failing(&self, failing: bool) {
        self.faults.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.faults.writes.load(Ordering::SeqCst)
    }

    /// Indexed text for an id.
    pub async fn text(&self, canonical_id: &CanonicalId) -> Option<String> {
        self.docs
            .read()
            .await
            .get(canonical_id)
            .map(|e| e.text.clone())
    }

    /// Replace the stored hash behind the canonical record's back.
    pub async fn overwrite_hash(&self, canonical_id: &CanonicalId, hash: ContentHash) {
        if let Some(entry) = self.docs.write().await.get_mut(canonical_id) {
            entry.hash = hash;
        }
    }
}

#[async_trait]
impl LexicalStore for MemoryLexicalStore {
    async fn write(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        hash: &ContentHash,
    ) -> Result<()> {
        self.faults.check("lexical", canonical_id)?;
        self.docs.write().await.insert(
            canonical_id.clone(),
            LexicalEntry {
                hash: hash.clone(),
                text: doc.indexable_text(),
            },
        );
        Ok(())
    }

    async fn stored_hash(&self, canonical_id: &CanonicalId) -> Result<Option<ContentHash>> {
        Ok(self
            .docs
            .read()
            .await
            .get(canonical_id)
            .map(|e| e.hash.clone()))
    }
}

#[derive(Debug, Clone)]
struct VectorEntry {
    hash: ContentHash,
    embedding: Vec<f32>,
}

/// In-memory implementation of VectorStore.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    vectors: RwLock<HashMap<CanonicalId, VectorEntry>>,
    faults: FaultInjection,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.faults.failing.store(failing, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.faults.writes.load(Ordering::SeqCst)
    }

    pub async fn embedding(&self, canonical_id: &CanonicalId) -> Option<Vec<f32>> {
        self.vectors
            .read()
            .await
            .get(canonical_id)
            .map(|e| e.embedding.clone())
    }

    pub async fn overwrite_hash(&self, canonical_id: &CanonicalId, hash: ContentHash) {
        if let Some(entry) = self.vectors.write().await.get_mut(canonical_id) {
            entry.hash = hash;
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn write(
        &self,
        canonical_id: &CanonicalId,
        _doc: &IndexDocument,
        embedding: &[f32],
        hash: &ContentHash,
    ) -> Result<()> {
        if embedding.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty embedding for {}",
                canonical_id
            )));
        }
        self.faults.check("vector", canonical_id)?;
        self.vectors.write().await.insert(
            canonical_id.clone(),
            VectorEntry {
                hash: hash.clone(),
                embedding: embedding.to_vec(),
            },
        );
        Ok(())
    }

    async fn stored_hash(&self, canonical_id: &CanonicalId) -> Result<Option<ContentHash>> {
        Ok(self
            .vectors
            .read()
            .await
            .get(canonical_id)
            .map(|e| e.hash.clone()))
    }
}
