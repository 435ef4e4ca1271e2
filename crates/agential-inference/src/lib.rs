//! # agential-inference
//!
//! Inference backends and the failover router for the agential orchestration core.
//!
//! This crate provides:
//! - OpenAI-compatible chat backend (vLLM, the declared primary)
//! - Ollama chat and embedding backend (the declared secondary)
//! - `ProviderRouter`: sticky primary/secondary failover with background probes
//!
//! # Feature Flags
//!
//! - `mock`: expose the scripted `MockProvider` to dependent crates' tests
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agential_inference::{
//!     InferenceRequest, OllamaProvider, OpenAiCompatProvider, ProviderRouter, RouterConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> agential_inference::Result<()> {
//!     let router = ProviderRouter::new(
//!         Arc::new(OpenAiCompatProvider::from_env()?),
//!         Arc::new(OllamaProvider::from_env()?),
//!         RouterConfig::from_env(),
//!     );
//!     router.boot().await;
//!     let response = router.call(&InferenceRequest::prompt("Hello")).await?;
//!     println!("{} answered: {}", response.provider, response.content);
//!     Ok(())
//! }
//! ```

mod http;
pub mod ollama;
pub mod openai;
pub mod router;

// Scripted provider for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use agential_core::*;

pub use http::service_answered;
pub use ollama::{OllamaConfig, OllamaProvider};
pub use openai::{OpenAiCompatConfig, OpenAiCompatProvider};
pub use router::{ProbeHandle, ProviderRouter, RouterConfig, RouterState};
