//! Centralized default constants for the orchestration core.
//!
//! **This module is the single source of truth** for shared default values.
//! Every `from_env()` constructor falls back to these constants when the
//! corresponding environment variable is unset or unparsable.
//!
//! Organized by domain area.

// =============================================================================
// LANES
// =============================================================================

/// Hot lane: interactive ingest/summarize/embed work.
pub const LANE_HOT_MAX_DEPTH: usize = 1_000;
pub const LANE_HOT_MAX_IN_FLIGHT: usize = 8;
pub const LANE_HOT_TTL_SECS: u64 = 15 * 60;

/// VLM/OCR lane. Depth mirrors the vlm_ocr queue cap of 100.
pub const LANE_VLM_OCR_MAX_DEPTH: usize = 100;
pub const LANE_VLM_OCR_MAX_IN_FLIGHT: usize = 2;
pub const LANE_VLM_OCR_TTL_SECS: u64 = 60 * 60;

/// Maintenance lane: reindex and knowledge-graph linking.
pub const LANE_MAINTENANCE_MAX_DEPTH: usize = 5_000;
pub const LANE_MAINTENANCE_MAX_IN_FLIGHT: usize = 2;
pub const LANE_MAINTENANCE_TTL_SECS: u64 = 6 * 60 * 60;

/// Backfill lane: bulk re-ingest, lowest priority.
pub const LANE_BACKFILL_MAX_DEPTH: usize = 50_000;
pub const LANE_BACKFILL_MAX_IN_FLIGHT: usize = 2;
pub const LANE_BACKFILL_TTL_SECS: u64 = 24 * 60 * 60;

// =============================================================================
// RESOURCE GATES
// =============================================================================

/// vlm_ocr admission closes at or above this accelerator utilization (0.0-1.0).
pub const VLM_OCR_MAX_UTILIZATION: f64 = 0.6;

/// vlm_ocr admission closes while the hot lane holds at least this many pending jobs.
pub const VLM_OCR_MAX_HOT_DEPTH: usize = 8;

// =============================================================================
// RETRY
// =============================================================================

/// Maximum attempts before a job is dead-lettered.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// First retry delay; doubles per attempt.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound on the exponential part of the retry delay.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Uniform random jitter added on top of the capped delay.
pub const RETRY_JITTER_MS: u64 = 250;

// =============================================================================
// WORKERS
// =============================================================================

/// Idle poll interval when no job is eligible (workers are also woken on submit).
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Overall per-job execution timeout in seconds (5 minutes).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Interval between TTL sweeps over every lane.
pub const JOB_SWEEP_INTERVAL_SECS: u64 = 60;

/// Workers per job kind.
pub const WORKERS_INGEST: usize = 4;
pub const WORKERS_SUMMARIZE: usize = 2;
pub const WORKERS_EMBED: usize = 2;
pub const WORKERS_OCR: usize = 1;
pub const WORKERS_KG_LINK: usize = 1;
pub const WORKERS_REINDEX: usize = 1;

/// Capacity of broadcast channels (worker and consistency events).
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// INFERENCE
// =============================================================================

/// Primary (OpenAI-compatible, vLLM) endpoint.
pub const VLLM_URL: &str = "http://vllm:8000";

/// Secondary (Ollama) endpoint.
pub const OLLAMA_URL: &str = "http://ollama:11434";

/// Default chat model served by both endpoints.
pub const GEN_MODEL: &str = "llama3.1:8b";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Bounded timeout for a single live inference call.
pub const PROVIDER_CALL_TIMEOUT_SECS: u64 = 120;

/// Bounded timeout for a health probe.
pub const PROVIDER_PROBE_TIMEOUT_SECS: u64 = 10;

/// Background probe cadence.
pub const PROVIDER_PROBE_INTERVAL_SECS: u64 = 30;

/// Summaries are short and low-temperature.
pub const SUMMARY_MAX_TOKENS: u32 = 512;
pub const SUMMARY_TEMPERATURE: f32 = 0.3;

// =============================================================================
// CONSISTENCY
// =============================================================================

/// Reconciliation pass cadence.
pub const RECONCILE_INTERVAL_SECS: u64 = 300;

/// Bounded timeout for one lexical or vector store write.
pub const STORE_WRITE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// DATABASE
// =============================================================================

pub const DB_MAX_CONNECTIONS: u32 = 10;
pub const DB_MIN_CONNECTIONS: u32 = 1;
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_in_flight_below_depth() {
        assert!(LANE_HOT_MAX_IN_FLIGHT <= LANE_HOT_MAX_DEPTH);
        assert!(LANE_VLM_OCR_MAX_IN_FLIGHT <= LANE_VLM_OCR_MAX_DEPTH);
        assert!(LANE_MAINTENANCE_MAX_IN_FLIGHT <= LANE_MAINTENANCE_MAX_DEPTH);
        assert!(LANE_BACKFILL_MAX_IN_FLIGHT <= LANE_BACKFILL_MAX_DEPTH);
    }

    #[test]
    fn test_retry_delays_ordered() {
        assert!(RETRY_BASE_DELAY_MS <= RETRY_MAX_DELAY_MS);
        assert!(JOB_MAX_ATTEMPTS >= 1);
    }

    #[test]
    fn test_utilization_threshold_in_range() {
        assert!(VLM_OCR_MAX_UTILIZATION > 0.0 && VLM_OCR_MAX_UTILIZATION <= 1.0);
    }

    #[test]
    fn test_probe_timeout_shorter_than_call() {
        assert!(PROVIDER_PROBE_TIMEOUT_SECS < PROVIDER_CALL_TIMEOUT_SECS);
    }
}
