//! # agential-search
//!
//! Keeps the lexical (full-text) and vector (embedding) indexes coherent
//! under a shared canonical-id space.
//!
//! This crate provides:
//! - `ConsistencyManager`: idempotent dual-store upsert with explicit partial results
//! - `Reconciler`: periodic divergence detection with broadcast fault events
//! - PostgreSQL stores (`tsvector` and `pgvector`) and in-memory stores

pub mod consistency;
pub mod memory;
pub mod postgres;
pub mod reconciler;

pub use consistency::{ConsistencyConfig, ConsistencyManager};
pub use memory::{MemoryLexicalStore, MemoryVectorStore};
pub use postgres::{PgLexicalStore, PgVectorStore};
pub use reconciler::{
    ConsistencyEvent, ReconcileReport, Reconciler, ReconcilerConfig, ReconcilerHandle,
};
