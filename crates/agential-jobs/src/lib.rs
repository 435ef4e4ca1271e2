//! # agential-jobs
//!
//! Lane scheduling and job execution for the agential orchestration core.
//!
//! This crate provides:
//! - `Scheduler`: four priority lanes with depth caps, in-flight bounds,
//!   TTL dead-lettering, resource gates and coalescing
//! - `RetryPolicy`: capped exponential backoff with jitter
//! - `WorkerPool`: fixed per-kind workers with broadcast lifecycle events
//! - Handlers for summarize, index writes and external stages
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use agential_db::MemoryJobStore;
//! use agential_jobs::{HandlerRegistry, Scheduler, SchedulerConfig, WorkerConfig, WorkerPool};
//!
//! let scheduler = Arc::new(Scheduler::new(Arc::new(MemoryJobStore::new()), SchedulerConfig::from_env()));
//! scheduler.restore().await?;
//!
//! let registry = HandlerRegistry::new().with_handler(my_handler);
//! let handle = WorkerPool::new(scheduler.clone(), registry, WorkerConfig::from_env()).start();
//!
//! scheduler.submit(NewJob::new(JobKind::Summarize, json!({"content": "..."}))).await?;
//! handle.shutdown().await?;
//! ```

pub mod backoff;
pub mod gate;
pub mod handler;
pub mod handlers;
pub mod lane;
pub mod scheduler;
pub mod worker;

// Re-export core types
pub use agential_core::*;

pub use backoff::RetryPolicy;
pub use gate::{AlwaysOpen, GateView, ResourceGate, SharedUtilization, UtilizationGate};
pub use handler::{JobContext, JobHandler, JobResult};
pub use handlers::{
    IndexHandler, ProcessingStage, StageHandler, StageOutput, SummarizeHandler,
    SUMMARY_INPUT_CHARS,
};
pub use lane::{LaneConfig, SchedulerConfig};
pub use scheduler::{LaneStats, Scheduler};
pub use worker::{HandlerRegistry, WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};
