//! Error types for the orchestration core.
//!
//! The taxonomy drives propagation: admission rejections and fatal errors go
//! straight back to the submitter, transient failures are absorbed by the
//! retry policy, and consistency faults are reported out-of-band.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{JobState, Lane, RejectReason};

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// One endpoint's failure during a routed inference call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    /// Endpoint identity (e.g. "vllm", "ollama").
    pub endpoint: String,
    /// Human-readable cause (status code, timeout, transport error).
    pub cause: String,
}

impl EndpointFailure {
    pub fn new(endpoint: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.cause)
    }
}

/// Both endpoints' failures for a single routed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailures {
    /// The endpoint that was tried first.
    pub first: EndpointFailure,
    /// The fallback endpoint.
    pub fallback: EndpointFailure,
}

impl fmt::Display for ProviderFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Both inference providers failed: [{}] [{}]",
            self.first, self.fallback
        )
    }
}

/// Core error type for orchestration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Target lane is at max depth; the caller must back off.
    #[error("Admission rejected for lane {lane}: {reason}")]
    AdmissionRejected { lane: Lane, reason: RejectReason },

    /// Transient provider or storage failure.
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Malformed payload or unsupported job kind.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Every inference endpoint failed within one call.
    #[error("{0}")]
    ProviderUnavailable(Box<ProviderFailures>),

    /// The two stores disagree for a settled canonical id.
    #[error("Consistency fault for {canonical_id}: {detail}")]
    ConsistencyFault {
        canonical_id: String,
        detail: String,
    },

    /// A state change that the job state machine does not allow.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// A single inference endpoint failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Lexical or vector store write failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is transient and should go through retry/backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Retryable(_)
                | Error::ProviderUnavailable(_)
                | Error::Timeout(_)
                | Error::Database(_)
                | Error::Inference(_)
                | Error::Storage(_)
                | Error::Request(_)
        )
    }

    /// Build a provider-unavailable error from both endpoint failures.
    pub fn provider_unavailable(first: EndpointFailure, fallback: EndpointFailure) -> Self {
        Error::ProviderUnavailable(Box::new(ProviderFailures { first, fallback }))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_retryable() {
        let err = Error::Retryable("vector store busy".to_string());
        assert_eq!(err.to_string(), "Retryable error: vector store busy");
    }

    #[test]
    fn test_error_display_fatal() {
        let err = Error::Fatal("payload missing content".to_string());
        assert_eq!(err.to_string(), "Fatal error: payload missing content");
    }

    #[test]
    fn test_admission_rejected_display() {
        let err = Error::AdmissionRejected {
            lane: Lane::VlmOcr,
            reason: RejectReason::LaneFull {
                depth: 100,
                max_depth: 100,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("vlm_ocr"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_provider_unavailable_names_both_endpoints() {
        let err = Error::provider_unavailable(
            EndpointFailure::new("vllm", "HTTP 503"),
            EndpointFailure::new("ollama", "timed out after 5s"),
        );
        let msg = err.to_string();
        assert!(msg.contains("vllm"));
        assert!(msg.contains("HTTP 503"));
        assert!(msg.contains("ollama"));
        assert!(msg.contains("timed out after 5s"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let id = Uuid::nil();
        let err = Error::InvalidTransition {
            job_id: id,
            from: JobState::Completed,
            to: JobState::Running,
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid transition for job {}: completed -> running", id)
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Retryable("x".into()).is_retryable());
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(Error::Storage("x".into()).is_retryable());
        assert!(Error::Inference("x".into()).is_retryable());
        assert!(Error::provider_unavailable(
            EndpointFailure::new("a", "x"),
            EndpointFailure::new("b", "y")
        )
        .is_retryable());

        assert!(!Error::Fatal("x".into()).is_retryable());
        assert!(!Error::InvalidInput("x".into()).is_retryable());
        assert!(!Error::ConsistencyFault {
            canonical_id: "arxiv:1".into(),
            detail: "x".into()
        }
        .is_retryable());
        assert!(!Error::AdmissionRejected {
            lane: Lane::Hot,
            reason: RejectReason::LaneFull {
                depth: 1,
                max_depth: 1
            }
        }
        .is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
