//! In-memory job and canonical-record stores.
//!
//! Used when no `DATABASE_URL` is configured and throughout the test suites.
//! State lives for the life of the process only.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use agential_core::{
    CanonicalId, CanonicalRecord, CanonicalStore, ContentHash, Error, Job, JobKind, JobState,
    JobStore, Result, StateChange, StoreSide,
};

/// In-memory implementation of JobStore.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs in any state.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::InvalidInput(format!("duplicate job id {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_state(&self, job_id: Uuid, change: StateChange) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        job.apply(&change, Utc::now())?;
        Ok(job.clone())
    }

    async fn find_active(&self, canonical_id: &CanonicalId, kind: JobKind) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.kind == kind && j.state.is_active())
            .filter(|j| j.canonical_id.as_ref() == Some(canonical_id))
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    async fn has_active_for(&self, canonical_id: &CanonicalId) -> Result<bool> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .any(|j| j.state.is_active() && j.canonical_id.as_ref() == Some(canonical_id)))
    }

    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }
}

/// In-memory implementation of CanonicalStore.
#[derive(Default)]
pub struct MemoryCanonicalStore {
    records: RwLock<HashMap<CanonicalId, CanonicalRecord>>,
}

impl MemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CanonicalStore for MemoryCanonicalStore {
    async fn get(&self, canonical_id: &CanonicalId) -> Result<Option<CanonicalRecord>> {
        Ok(self.records.read().await.get(canonical_id).cloned())
    }

    async fn record_write(
        &self,
        canonical_id: &CanonicalId,
        side: StoreSide,
        hash: &ContentHash,
    ) -> Result<CanonicalRecord> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let record = records
            .entry(canonical_id.clone())
            .and_modify(|r| r.record_write(side, hash.clone(), now))
            .or_insert_with(|| {
                CanonicalRecord::first_write(canonical_id.clone(), side, hash.clone(), now)
            });
        Ok(record.clone())
    }

    async fn touched_since(&self, since: DateTime<Utc>) -> Result<Vec<CanonicalRecord>> {
        let mut records: Vec<CanonicalRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.updated_at >= since)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agential_core::{JobOutcome, NewJob};
    use serde_json::json;

    fn ingest_job(id: &str) -> Job {
        Job::new(
            NewJob::new(JobKind::Ingest, json!({}))
                .with_canonical_id(CanonicalId::arxiv(id).unwrap()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryJobStore::new();
        let job = ingest_job("2401.00001");
        store.insert(&job).await.unwrap();

        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert!(store.insert(&job).await.is_err());
        assert!(store.get(Uuid::nil()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_state_validates_transition() {
        let store = MemoryJobStore::new();
        let job = ingest_job("2401.00002");
        store.insert(&job).await.unwrap();

        let err = store
            .mark_terminal(job.id, JobOutcome::Completed { result_ref: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        store.update_state(job.id, StateChange::start()).await.unwrap();
        let done = store
            .mark_terminal(
                job.id,
                JobOutcome::Completed {
                    result_ref: Some("r".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result_ref.as_deref(), Some("r"));

        // Terminal states never change.
        assert!(store
            .update_state(job.id, StateChange::requeue(Utc::now()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = MemoryJobStore::new();
        let err = store
            .update_state(Uuid::nil(), StateChange::start())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_find_active_ignores_terminal() {
        let store = MemoryJobStore::new();
        let job = ingest_job("2401.00003");
        let id = job.canonical_id.clone().unwrap();
        store.insert(&job).await.unwrap();

        assert_eq!(
            store.find_active(&id, JobKind::Ingest).await.unwrap().map(|j| j.id),
            Some(job.id)
        );
        assert!(store.find_active(&id, JobKind::Embed).await.unwrap().is_none());
        assert!(store.has_active_for(&id).await.unwrap());

        store.update_state(job.id, StateChange::start()).await.unwrap();
        store
            .mark_terminal(job.id, JobOutcome::Failed { error: "gone".into() })
            .await
            .unwrap();
        assert!(store.find_active(&id, JobKind::Ingest).await.unwrap().is_none());
        assert!(!store.has_active_for(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_state_orders_by_enqueue() {
        let store = MemoryJobStore::new();
        let first = ingest_job("2401.00004");
        let mut second = ingest_job("2401.00005");
        second.enqueued_at = first.enqueued_at + chrono::Duration::seconds(1);
        store.insert(&second).await.unwrap();
        store.insert(&first).await.unwrap();

        let pending = store.list_by_state(JobState::Pending, 10).await.unwrap();
        assert_eq!(
            pending.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
        assert_eq!(store.list_by_state(JobState::Pending, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_canonical_record_write_sequence() {
        let store = MemoryCanonicalStore::new();
        let id = CanonicalId::arxiv("1706.03762").unwrap();
        let h1 = ContentHash::of_bytes(b"v1");
        let h2 = ContentHash::of_bytes(b"v2");

        assert!(store.get(&id).await.unwrap().is_none());

        let rec = store.record_write(&id, StoreSide::Lexical, &h1).await.unwrap();
        assert_eq!(rec.lexical_version, 1);
        assert_eq!(rec.vector_version, 0);
        assert!(!rec.is_consistent());

        let rec = store.record_write(&id, StoreSide::Vector, &h1).await.unwrap();
        assert!(rec.is_consistent());

        let rec = store.record_write(&id, StoreSide::Vector, &h2).await.unwrap();
        assert_eq!(rec.content_hash, h2);
        assert_eq!(rec.vector_version, 2);
        assert!(!rec.is_consistent());
        assert_eq!(rec.created_at, store.get(&id).await.unwrap().unwrap().created_at);
    }

    #[tokio::test]
    async fn test_touched_since() {
        let store = MemoryCanonicalStore::new();
        let a = CanonicalId::arxiv("1").unwrap();
        let b = CanonicalId::hf_model("bert").unwrap();
        let h = ContentHash::of_bytes(b"x");

        store.record_write(&a, StoreSide::Lexical, &h).await.unwrap();
        let mark = Utc::now();
        store.record_write(&b, StoreSide::Lexical, &h).await.unwrap();

        let touched = store.touched_since(mark).await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].canonical_id, b);
    }
}
