//! PostgreSQL canonical-record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use agential_core::{
    CanonicalId, CanonicalRecord, CanonicalStore, ContentHash, Error, Result, StoreSide,
};

const RECORD_COLUMNS: &str = "canonical_id, content_hash, lexical_hash, vector_hash, \
     lexical_version, vector_version, created_at, updated_at";

/// PostgreSQL implementation of CanonicalStore.
#[derive(Clone)]
pub struct PgCanonicalStore {
    pool: Pool<Postgres>,
}

impl PgCanonicalStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: &PgRow) -> Result<CanonicalRecord> {
        let canonical_id: String = row.try_get("canonical_id")?;
        let content_hash: String = row.try_get("content_hash")?;
        let lexical_hash: Option<String> = row.try_get("lexical_hash")?;
        let vector_hash: Option<String> = row.try_get("vector_hash")?;

        Ok(CanonicalRecord {
            canonical_id: CanonicalId::parse(&canonical_id)?,
            content_hash: ContentHash::from_hex(&content_hash)?,
            lexical_hash: lexical_hash.as_deref().map(ContentHash::from_hex).transpose()?,
            vector_hash: vector_hash.as_deref().map(ContentHash::from_hex).transpose()?,
            lexical_version: row.try_get("lexical_version")?,
            vector_version: row.try_get("vector_version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl CanonicalStore for PgCanonicalStore {
    async fn get(&self, canonical_id: &CanonicalId) -> Result<Option<CanonicalRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM canonical_records WHERE canonical_id = $1",
            RECORD_COLUMNS
        ))
        .bind(canonical_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_record_row).transpose()
    }

    async fn record_write(
        &self,
        canonical_id: &CanonicalId,
        side: StoreSide,
        hash: &ContentHash,
    ) -> Result<CanonicalRecord> {
        let (lexical_hash, vector_hash, lexical_bump, vector_bump) = match side {
            StoreSide::Lexical => (Some(hash.as_str()), None, 1_i64, 0_i64),
            StoreSide::Vector => (None, Some(hash.as_str()), 0_i64, 1_i64),
        };

        let row = sqlx::query(&format!(
            "INSERT INTO canonical_records
                 (canonical_id, content_hash, lexical_hash, vector_hash,
                  lexical_version, vector_version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
             ON CONFLICT (canonical_id) DO UPDATE SET
                 content_hash = EXCLUDED.content_hash,
                 lexical_hash = COALESCE(EXCLUDED.lexical_hash, canonical_records.lexical_hash),
                 vector_hash = COALESCE(EXCLUDED.vector_hash, canonical_records.vector_hash),
                 lexical_version = canonical_records.lexical_version + EXCLUDED.lexical_version,
                 vector_version = canonical_records.vector_version + EXCLUDED.vector_version,
                 updated_at = EXCLUDED.updated_at
             RETURNING {}",
            RECORD_COLUMNS
        ))
        .bind(canonical_id.as_str())
        .bind(hash.as_str())
        .bind(lexical_hash)
        .bind(vector_hash)
        .bind(lexical_bump)
        .bind(vector_bump)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_record_row(&row)
    }

    async fn touched_since(&self, since: DateTime<Utc>) -> Result<Vec<CanonicalRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM canonical_records WHERE updated_at >= $1 ORDER BY updated_at",
            RECORD_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_record_row).collect()
    }
}
