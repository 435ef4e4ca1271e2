//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use agential_core::{
    CanonicalId, Error, Job, JobKind, JobState, JobStore, Result, StateChange,
};

const JOB_COLUMNS: &str = "id, kind, lane, canonical_id, payload, state, attempt_count, \
     max_attempts, created_at, updated_at, enqueued_at, next_eligible_at, result_ref, last_error";

/// PostgreSQL implementation of JobStore.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: &PgRow) -> Result<Job> {
        let kind: String = row.try_get("kind")?;
        let lane: String = row.try_get("lane")?;
        let state: String = row.try_get("state")?;
        let canonical_id: Option<String> = row.try_get("canonical_id")?;

        Ok(Job {
            id: row.try_get("id")?,
            kind: kind.parse()?,
            lane: lane.parse()?,
            canonical_id: canonical_id.as_deref().map(CanonicalId::parse).transpose()?,
            payload: row.try_get("payload")?,
            state: state.parse()?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            enqueued_at: row.try_get("enqueued_at")?,
            next_eligible_at: row.try_get("next_eligible_at")?,
            result_ref: row.try_get("result_ref")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, kind, lane, canonical_id, payload, state, attempt_count,
                               max_attempts, created_at, updated_at, enqueued_at,
                               next_eligible_at, result_ref, last_error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(job.id)
        .bind(job.kind.as_str())
        .bind(job.lane.as_str())
        .bind(job.canonical_id.as_ref().map(CanonicalId::as_str))
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(job.attempt_count)
        .bind(job.max_attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.enqueued_at)
        .bind(job.next_eligible_at)
        .bind(&job.result_ref)
        .bind(&job.last_error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "job_store",
            op = "insert",
            job_id = %job.id,
            job_kind = %job.kind,
            lane = %job.lane,
            "Job persisted"
        );
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn update_state(&self, job_id: Uuid, change: StateChange) -> Result<Job> {
        let allowed_from: Vec<String> = JobState::predecessors(change.to)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // The state guard in WHERE makes the transition check and the write atomic.
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET state = $2,
                 updated_at = $3,
                 next_eligible_at = $4,
                 attempt_count = COALESCE($5, attempt_count),
                 enqueued_at = COALESCE($6, enqueued_at),
                 last_error = COALESCE($7, last_error),
                 result_ref = CASE WHEN $2 = 'completed' THEN $8 ELSE result_ref END
             WHERE id = $1 AND state = ANY($9)
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(change.to.as_str())
        .bind(Utc::now())
        .bind(change.next_eligible_at)
        .bind(change.attempt_count)
        .bind(change.enqueued_at)
        .bind(&change.error)
        .bind(&change.result_ref)
        .bind(&allowed_from)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_job_row(&row),
            None => match self.get(job_id).await? {
                Some(current) => Err(Error::InvalidTransition {
                    job_id,
                    from: current.state,
                    to: change.to,
                }),
                None => Err(Error::JobNotFound(job_id)),
            },
        }
    }

    async fn find_active(&self, canonical_id: &CanonicalId, kind: JobKind) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs
             WHERE canonical_id = $1 AND kind = $2
               AND state IN ('pending', 'admitted', 'running')
             ORDER BY created_at
             LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(canonical_id.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn has_active_for(&self, canonical_id: &CanonicalId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM jobs
                WHERE canonical_id = $1 AND state IN ('pending', 'admitted', 'running')
             )",
        )
        .bind(canonical_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(exists)
    }

    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE state = $1 ORDER BY enqueued_at, id LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_job_row).collect()
    }
}
