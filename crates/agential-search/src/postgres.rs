//! PostgreSQL lexical (tsvector) and vector (pgvector) stores.

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::{Pool, Postgres};

use agential_core::{
    CanonicalId, ContentHash, Error, IndexDocument, LexicalStore, Result, VectorStore,
};

fn parse_stored_hash(value: Option<String>) -> Result<Option<ContentHash>> {
    value.as_deref().map(ContentHash::from_hex).transpose()
}

/// PostgreSQL implementation of LexicalStore.
///
/// The weighted `tsv` column is generated by the database from title and body.
#[derive(Clone)]
pub struct PgLexicalStore {
    pool: Pool<Postgres>,
}

impl PgLexicalStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LexicalStore for PgLexicalStore {
    async fn write(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        hash: &ContentHash,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO lexical_documents (canonical_id, content_hash, title, body, metadata, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (canonical_id) DO UPDATE SET
                content_hash = EXCLUDED.content_hash,
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
             WHERE lexical_documents.content_hash IS DISTINCT FROM EXCLUDED.content_hash",
        )
        .bind(canonical_id.as_str())
        .bind(hash.as_str())
        .bind(doc.title.as_deref())
        .bind(&doc.body)
        .bind(metadata_or_empty(doc))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("lexical write for {}: {}", canonical_id, e)))?;
        Ok(())
    }

    async fn stored_hash(&self, canonical_id: &CanonicalId) -> Result<Option<ContentHash>> {
        let hash: Option<String> = sqlx::query_scalar(
            "SELECT content_hash FROM lexical_documents WHERE canonical_id = $1",
        )
        .bind(canonical_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        parse_stored_hash(hash)
    }
}

/// PostgreSQL implementation of VectorStore.
#[derive(Clone)]
pub struct PgVectorStore {
    pool: Pool<Postgres>,
}

impl PgVectorStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn write(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        embedding: &[f32],
        hash: &ContentHash,
    ) -> Result<()> {
        if embedding.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty embedding for {}",
                canonical_id
            )));
        }

        sqlx::query(
            "INSERT INTO vector_documents (canonical_id, content_hash, embedding, metadata, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (canonical_id) DO UPDATE SET
                content_hash = EXCLUDED.content_hash,
                embedding = EXCLUDED.embedding,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
             WHERE vector_documents.content_hash IS DISTINCT FROM EXCLUDED.content_hash",
        )
        .bind(canonical_id.as_str())
        .bind(hash.as_str())
        .bind(Vector::from(embedding.to_vec()))
        .bind(metadata_or_empty(doc))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("vector write for {}: {}", canonical_id, e)))?;
        Ok(())
    }

    async fn stored_hash(&self, canonical_id: &CanonicalId) -> Result<Option<ContentHash>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM vector_documents WHERE canonical_id = $1")
                .bind(canonical_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        parse_stored_hash(hash)
    }
}

fn metadata_or_empty(doc: &IndexDocument) -> serde_json::Value {
    if doc.metadata.is_null() {
        serde_json::json!({})
    } else {
        doc.metadata.clone()
    }
}
