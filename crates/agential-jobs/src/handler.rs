//! Job handler trait and the outcomes a handler can report.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use agential_core::{CanonicalId, Error, Job, JobKind, Result};

/// Context handed to a handler for one execution.
pub struct JobContext {
    /// The job being processed, already `running`.
    pub job: Job,
    /// Worker executing the job.
    pub worker_id: String,
}

impl JobContext {
    pub fn new(job: Job, worker_id: impl Into<String>) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
        }
    }

    /// 1-based number of this execution.
    pub fn attempt(&self) -> i32 {
        self.job.attempt_count + 1
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Deserialize the payload, mapping a mismatch to `InvalidInput`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.job.payload.clone()).map_err(|e| {
            Error::InvalidInput(format!("{} payload for job {}: {}", self.job.kind, self.job.id, e))
        })
    }

    /// Canonical id from the job itself, or a `canonical_id` field in the payload.
    pub fn canonical_id(&self) -> Result<CanonicalId> {
        if let Some(id) = &self.job.canonical_id {
            return Ok(id.clone());
        }
        match self.job.payload.get("canonical_id").and_then(JsonValue::as_str) {
            Some(raw) => CanonicalId::parse(raw),
            None => Err(Error::InvalidInput(format!(
                "{} job {} has no canonical id",
                self.job.kind, self.job.id
            ))),
        }
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Completed; the optional reference is stored as `result_ref`.
    Success(Option<String>),
    /// Transient failure, goes through the retry policy.
    Retry(String),
    /// Dead-letter immediately.
    Fatal(String),
    /// Expected permanent failure; terminal `failed`.
    Failed(String),
}

impl JobResult {
    pub fn success(result_ref: impl Into<String>) -> Self {
        JobResult::Success(Some(result_ref.into()))
    }
}

impl From<Error> for JobResult {
    /// Retryable errors retry; everything else dead-letters.
    fn from(err: Error) -> Self {
        if err.is_retryable() {
            JobResult::Retry(err.to_string())
        } else {
            JobResult::Fatal(err.to_string())
        }
    }
}

/// Executes one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> JobKind;

    async fn execute(&self, ctx: JobContext) -> JobResult;
}
