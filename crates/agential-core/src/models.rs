//! Job and lane data structures.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::canonical::CanonicalId;
use crate::error::{Error, Result};

// =============================================================================
// LANES
// =============================================================================

/// Scheduler lane, declared in strict priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Real-time work on behalf of an interactive caller.
    Hot,
    /// Vision/OCR work competing for the accelerator.
    VlmOcr,
    /// Reindexing and graph linking.
    Maintenance,
    /// Bulk historical re-ingest.
    Backfill,
}

impl Lane {
    /// All lanes, highest priority first.
    pub const ALL: [Lane; 4] = [Lane::Hot, Lane::VlmOcr, Lane::Maintenance, Lane::Backfill];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Hot => "hot",
            Lane::VlmOcr => "vlm_ocr",
            Lane::Maintenance => "maintenance",
            Lane::Backfill => "backfill",
        }
    }

    /// Position in `Lane::ALL`.
    pub fn index(&self) -> usize {
        match self {
            Lane::Hot => 0,
            Lane::VlmOcr => 1,
            Lane::Maintenance => 2,
            Lane::Backfill => 3,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hot" => Ok(Lane::Hot),
            "vlm_ocr" => Ok(Lane::VlmOcr),
            "maintenance" => Ok(Lane::Maintenance),
            "backfill" => Ok(Lane::Backfill),
            other => Err(Error::InvalidInput(format!("unknown lane: {}", other))),
        }
    }
}

// =============================================================================
// JOB KINDS
// =============================================================================

/// Kind of processing stage a job invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Write fetched content into both stores
    Ingest,
    /// Generate a summary through the provider router
    Summarize,
    /// Refresh the vector side of a record
    Embed,
    /// Extract text from scanned documents
    Ocr,
    /// Link entities into the knowledge graph
    KgLink,
    /// Rewrite both stores from canonical content
    Reindex,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Ingest,
        JobKind::Summarize,
        JobKind::Embed,
        JobKind::Ocr,
        JobKind::KgLink,
        JobKind::Reindex,
    ];

    /// Lane a job of this kind lands in unless the submitter overrides it.
    pub fn default_lane(&self) -> Lane {
        match self {
            JobKind::Ingest | JobKind::Summarize | JobKind::Embed => Lane::Hot,
            JobKind::Ocr => Lane::VlmOcr,
            JobKind::KgLink | JobKind::Reindex => Lane::Maintenance,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingest => "ingest",
            JobKind::Summarize => "summarize",
            JobKind::Embed => "embed",
            JobKind::Ocr => "ocr",
            JobKind::KgLink => "kg_link",
            JobKind::Reindex => "reindex",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job kind: {}", s)))
    }
}

// =============================================================================
// JOB STATE
// =============================================================================

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Admitted,
    Running,
    Completed,
    Failed,
    DeadLettered,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Admitted,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Admitted => "admitted",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::DeadLettered
        )
    }

    /// Pending, admitted or running.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Transitions move forward only, except retry and worker-loss recovery
    /// which return an in-flight job to `Pending`. Terminal states are final.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Admitted | Running | DeadLettered)
                | (Admitted, Running | Pending | DeadLettered)
                | (Running, Completed | Failed | DeadLettered | Pending)
        )
    }

    /// States from which `to` may be entered.
    pub fn predecessors(to: JobState) -> Vec<JobState> {
        JobState::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job state: {}", s)))
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// A unit of work tracked by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub lane: Lane,
    pub canonical_id: Option<CanonicalId>,
    pub payload: JsonValue,
    pub state: JobState,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last entry into `pending`; the lane TTL runs from here.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time a retried job may be selected again.
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub result_ref: Option<String>,
    pub last_error: Option<String>,
}

impl Job {
    /// Materialize a submission as a fresh pending job.
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind: new.kind,
            lane: new.lane.unwrap_or_else(|| new.kind.default_lane()),
            canonical_id: new.canonical_id,
            payload: new.payload,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts: new
                .max_attempts
                .unwrap_or(crate::defaults::JOB_MAX_ATTEMPTS)
                .max(1),
            created_at: now,
            updated_at: now,
            enqueued_at: now,
            next_eligible_at: None,
            result_ref: None,
            last_error: None,
        }
    }

    /// Apply a state change, rejecting moves the state machine forbids.
    pub fn apply(&mut self, change: &StateChange, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(change.to) {
            return Err(Error::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to: change.to,
            });
        }
        self.state = change.to;
        self.updated_at = now;
        self.next_eligible_at = change.next_eligible_at;
        if let Some(count) = change.attempt_count {
            self.attempt_count = count;
        }
        if let Some(at) = change.enqueued_at {
            self.enqueued_at = at;
        }
        if let Some(err) = &change.error {
            self.last_error = Some(err.clone());
        }
        if change.to == JobState::Completed {
            self.result_ref = change.result_ref.clone();
        }
        Ok(())
    }
}

/// A job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: JsonValue,
    /// Overrides the kind's default lane.
    pub lane: Option<Lane>,
    pub canonical_id: Option<CanonicalId>,
    pub max_attempts: Option<i32>,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: JsonValue) -> Self {
        Self {
            kind,
            payload,
            lane: None,
            canonical_id: None,
            max_attempts: None,
        }
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }

    pub fn with_canonical_id(mut self, id: CanonicalId) -> Self {
        self.canonical_id = Some(id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Lane this submission targets.
    pub fn lane(&self) -> Lane {
        self.lane.unwrap_or_else(|| self.kind.default_lane())
    }
}

/// A state change written to the job store.
///
/// `next_eligible_at` is always written as given, so any change that does
/// not set it clears a previous retry delay.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub to: JobState,
    pub attempt_count: Option<i32>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
}

impl StateChange {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            attempt_count: None,
            enqueued_at: None,
            next_eligible_at: None,
            result_ref: None,
            error: None,
        }
    }

    pub fn admit() -> Self {
        Self::to(JobState::Admitted)
    }

    pub fn start() -> Self {
        Self::to(JobState::Running)
    }

    /// Back to `pending` with a delay after a transient failure.
    pub fn retry(
        attempt_count: i32,
        now: DateTime<Utc>,
        eligible_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            attempt_count: Some(attempt_count),
            enqueued_at: Some(now),
            next_eligible_at: Some(eligible_at),
            error: Some(error.into()),
            ..Self::to(JobState::Pending)
        }
    }

    /// Back to `pending` after worker loss; attempts are not charged.
    pub fn requeue(now: DateTime<Utc>) -> Self {
        Self {
            enqueued_at: Some(now),
            ..Self::to(JobState::Pending)
        }
    }

    pub fn dead_letter(attempt_count: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            attempt_count,
            error: Some(error.into()),
            ..Self::to(JobState::DeadLettered)
        }
    }
}

/// Terminal outcome recorded by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { result_ref: Option<String> },
    Failed { error: String },
    DeadLettered { error: String },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed { .. } => JobState::Completed,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::DeadLettered { .. } => JobState::DeadLettered,
        }
    }
}

impl From<JobOutcome> for StateChange {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed { result_ref } => StateChange {
                result_ref,
                ..StateChange::to(JobState::Completed)
            },
            JobOutcome::Failed { error } => StateChange {
                error: Some(error),
                ..StateChange::to(JobState::Failed)
            },
            JobOutcome::DeadLettered { error } => StateChange::dead_letter(None, error),
        }
    }
}

// =============================================================================
// SUBMISSION
// =============================================================================

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// The lane already holds `max_depth` pending jobs.
    LaneFull { depth: usize, max_depth: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::LaneFull { depth, max_depth } => {
                write!(f, "lane full (depth {}/{})", depth, max_depth)
            }
        }
    }
}

/// Result of `Scheduler::submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum SubmitResult {
    /// Dispatchable now; holds an in-flight slot.
    Admitted(Uuid),
    /// Waiting in its lane.
    Queued(Uuid),
    /// An active job for the same canonical id and kind already exists.
    Coalesced(Uuid),
    /// Refused; the caller must back off.
    Rejected(RejectReason),
}

impl SubmitResult {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            SubmitResult::Admitted(id) | SubmitResult::Queued(id) | SubmitResult::Coalesced(id) => {
                Some(*id)
            }
            SubmitResult::Rejected(_) => None,
        }
    }

    /// Convert a rejection into `Error::AdmissionRejected`.
    pub fn into_result(self, lane: Lane) -> Result<Uuid> {
        match self {
            SubmitResult::Rejected(reason) => Err(Error::AdmissionRejected { lane, reason }),
            SubmitResult::Admitted(id) | SubmitResult::Queued(id) | SubmitResult::Coalesced(id) => {
                Ok(id)
            }
        }
    }
}
