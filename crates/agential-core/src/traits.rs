//! Core traits for the orchestration core.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::canonical::*;
use crate::error::Result;
use crate::inference::*;
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Durable record of every job's identity, state and result reference.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly created job.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Apply a state change, validated against the job state machine.
    ///
    /// Fails with `Error::InvalidTransition` when the stored state does not
    /// allow the move and `Error::JobNotFound` when the id is unknown.
    async fn update_state(&self, job_id: Uuid, change: StateChange) -> Result<Job>;

    /// Record a terminal outcome.
    async fn mark_terminal(&self, job_id: Uuid, outcome: JobOutcome) -> Result<Job> {
        self.update_state(job_id, outcome.into()).await
    }

    /// Active (pending, admitted or running) job for this id and kind, if any.
    async fn find_active(&self, canonical_id: &CanonicalId, kind: JobKind) -> Result<Option<Job>>;

    /// Whether any active job of any kind references this id.
    async fn has_active_for(&self, canonical_id: &CanonicalId) -> Result<bool>;

    /// Jobs in `state`, oldest enqueue first.
    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>>;
}

// =============================================================================
// CONSISTENCY STORES
// =============================================================================

/// Per-id bookkeeping of what each store reflects.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn get(&self, canonical_id: &CanonicalId) -> Result<Option<CanonicalRecord>>;

    /// Record a confirmed write, creating the record on first write.
    async fn record_write(
        &self,
        canonical_id: &CanonicalId,
        side: StoreSide,
        hash: &ContentHash,
    ) -> Result<CanonicalRecord>;

    /// Records updated at or after `since`.
    async fn touched_since(&self, since: DateTime<Utc>) -> Result<Vec<CanonicalRecord>>;
}

/// Full-text side of the index.
#[async_trait]
pub trait LexicalStore: Send + Sync {
    /// Idempotent write of `doc` under `canonical_id`, tagged with `hash`.
    async fn write(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        hash: &ContentHash,
    ) -> Result<()>;

    /// Hash the store currently holds for the id.
    async fn stored_hash(&self, canonical_id: &CanonicalId) -> Result<Option<ContentHash>>;
}

/// Embedding side of the index.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent write of `embedding` under `canonical_id`, tagged with `hash`.
    async fn write(
        &self,
        canonical_id: &CanonicalId,
        doc: &IndexDocument,
        embedding: &[f32],
        hash: &ContentHash,
    ) -> Result<()>;

    async fn stored_hash(&self, canonical_id: &CanonicalId) -> Result<Option<ContentHash>>;
}

// =============================================================================
// INFERENCE
// =============================================================================

/// A chat-completion endpoint the router can fail over between.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Stable endpoint identity used in logs and errors.
    fn identity(&self) -> &str;

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse>;

    /// Minimal synthetic call. `Ok(())` means the service answered.
    async fn probe(&self) -> Result<()>;
}

/// Text embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

// =============================================================================
// RESOURCES
// =============================================================================

/// Read-only view of live accelerator load.
pub trait ResourceMonitor: Send + Sync {
    /// Current accelerator utilization in `0.0..=1.0`.
    fn accelerator_utilization(&self) -> f64;
}
