//! Scripted inference provider for deterministic testing.
//!
//! Clones share state, so a test can hand one clone to a router or worker
//! and flip the other between healthy and failing mid-test.
//!
//! ```rust
//! use agential_inference::mock::MockProvider;
//!
//! let provider = MockProvider::new("vllm").with_response("summary text");
//! provider.set_failing(true);
//! assert!(provider.is_failing());
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use agential_core::{
    Embedder, Error, InferenceProvider, InferenceRequest, InferenceResponse, Result,
};

#[derive(Debug)]
struct MockState {
    failing: AtomicBool,
    failure: Mutex<String>,
    response: Mutex<String>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    probes: AtomicUsize,
    embeds: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

/// Mock provider for router, handler and worker tests.
#[derive(Debug, Clone)]
pub struct MockProvider {
    identity: String,
    dimension: usize,
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            dimension: 8,
            state: Arc::new(MockState {
                failing: AtomicBool::new(false),
                failure: Mutex::new("HTTP 503 Service Unavailable".to_string()),
                response: Mutex::new("Mock response".to_string()),
                latency: Mutex::new(Duration::ZERO),
                calls: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                embeds: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start out failing every call and probe.
    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    /// Start out failing with a specific cause.
    pub fn failing_with(self, cause: impl Into<String>) -> Self {
        *self.state.failure.lock().unwrap() = cause.into();
        self.failing()
    }

    pub fn with_response(self, response: impl Into<String>) -> Self {
        *self.state.response.lock().unwrap() = response.into();
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock().unwrap() = latency;
    }

    pub fn is_failing(&self) -> bool {
        self.state.failing.load(Ordering::SeqCst)
    }

    /// Number of `complete` calls, successful or not.
    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn embed_count(&self) -> usize {
        self.state.embeds.load(Ordering::SeqCst)
    }

    /// Requests seen by `complete`, in order.
    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    async fn simulate(&self) -> Result<()> {
        let latency = *self.state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_failing() {
            let cause = self.state.failure.lock().unwrap().clone();
            return Err(Error::Inference(format!("{}: {}", self.identity, cause)));
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().unwrap().push(request.clone());
        self.simulate().await?;
        Ok(InferenceResponse {
            content: self.state.response.lock().unwrap().clone(),
            provider: self.identity.clone(),
            model: request.model.clone().unwrap_or_else(|| "mock".to_string()),
        })
    }

    async fn probe(&self) -> Result<()> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        self.simulate().await
    }
}

#[async_trait]
impl Embedder for MockProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.state.embeds.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(deterministic_embedding(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Character-hashed unit vector; the same text always maps to the same vector.
pub fn deterministic_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dimension.max(1)];
    for (i, c) in text.chars().enumerate() {
        let idx = (c as usize + i) % vec.len();
        vec[idx] += 0.1;
    }
    let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        vec.iter_mut().for_each(|x| *x /= magnitude);
    }
    vec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_failure_toggle() {
        let a = MockProvider::new("vllm");
        let b = a.clone();
        assert!(a.complete(&InferenceRequest::prompt("x")).await.is_ok());

        b.set_failing(true);
        let err = a.complete(&InferenceRequest::prompt("x")).await.unwrap_err();
        assert!(err.to_string().contains("503"));
        assert_eq!(b.call_count(), 2);
        assert_eq!(b.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_embedding_is_deterministic() {
        let p = MockProvider::new("ollama").with_dimension(16);
        let e1 = p.embed("quantum computing").await.unwrap();
        let e2 = p.embed("quantum computing").await.unwrap();
        assert_eq!(e1, e2);
        assert_eq!(e1.len(), 16);
        assert_eq!(p.embed_count(), 2);
    }

    #[test]
    fn test_embedding_normalized() {
        let v = deterministic_embedding("test", 32);
        let magnitude: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01);
    }
}
