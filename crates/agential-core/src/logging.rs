//! Structured logging schema and field name constants.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation can query by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Requires operator attention (consistency fault, both providers down) |
//! | WARN  | Automatic fallback applied (failover, retry, dead-letter) |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points (admission, gate checks, lane selection) |
//! | TRACE | Per-item iteration (reconciliation checks) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "inference", "search", "jobs", "daemon"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "scheduler", "worker", "router", "ollama", "consistency", "reconciler"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "submit", "next", "call", "probe", "upsert", "reconcile"
pub const OPERATION: &str = "op";

/// Worker identity (kind plus index).
pub const WORKER_ID: &str = "worker_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job kind enum variant.
pub const JOB_KIND: &str = "job_kind";

/// Scheduler lane.
pub const LANE: &str = "lane";

/// Canonical cross-store identifier.
pub const CANONICAL_ID: &str = "canonical_id";

/// Content hash being written.
pub const CONTENT_HASH: &str = "content_hash";

/// Inference endpoint identity.
pub const PROVIDER: &str = "provider";

/// Router state after a transition.
pub const ROUTER_STATE: &str = "router_state";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt number of the current execution.
pub const ATTEMPT: &str = "attempt";

/// Pending jobs in a lane.
pub const DEPTH: &str = "depth";

/// Admitted plus running jobs in a lane.
pub const IN_FLIGHT: &str = "in_flight";

/// Retry delay chosen by the backoff policy.
pub const DELAY_MS: &str = "delay_ms";

/// Number of records examined by a pass.
pub const RECORD_COUNT: &str = "record_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message on failure.
pub const ERROR_MSG: &str = "error";

/// Whether the operation succeeded.
pub const SUCCESS: &str = "success";

/// Every field name above, for log pipelines that whitelist keys.
pub const ALL_FIELDS: &[&str] = &[
    SUBSYSTEM,
    COMPONENT,
    OPERATION,
    WORKER_ID,
    JOB_ID,
    JOB_KIND,
    LANE,
    CANONICAL_ID,
    CONTENT_HASH,
    PROVIDER,
    ROUTER_STATE,
    DURATION_MS,
    ATTEMPT,
    DEPTH,
    IN_FLIGHT,
    DELAY_MS,
    RECORD_COUNT,
    ERROR_MSG,
    SUCCESS,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_field_names_unique_and_snake_case() {
        let unique: HashSet<_> = ALL_FIELDS.iter().collect();
        assert_eq!(unique.len(), ALL_FIELDS.len());
        for name in ALL_FIELDS {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
