//! # agential-core
//!
//! Core types, traits, and abstractions for the agential job orchestration core.
//!
//! This crate provides the foundational data structures (jobs, lanes, canonical
//! records, provider endpoints), the shared error taxonomy, and the trait seams
//! that the store, inference, and job crates implement.

pub mod canonical;
pub mod defaults;
pub mod error;
pub mod inference;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use canonical::*;
pub use error::{EndpointFailure, Error, ProviderFailures, Result};
pub use inference::*;
pub use models::*;
pub use traits::*;
