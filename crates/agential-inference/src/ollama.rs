//! Ollama chat and embedding backend.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use agential_core::defaults::{
    EMBED_DIMENSION, EMBED_MODEL, GEN_MODEL, OLLAMA_URL, PROVIDER_CALL_TIMEOUT_SECS,
};
use agential_core::{
    ChatMessage, Embedder, Error, InferenceProvider, InferenceRequest, InferenceResponse, Result,
};

use crate::http::{build_client, ensure_success, service_answered, transport_error};

/// Configuration for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub identity: String,
    pub base_url: String,
    pub gen_model: String,
    pub embed_model: String,
    pub embed_dimension: usize,
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            identity: "ollama".to_string(),
            base_url: OLLAMA_URL.to_string(),
            gen_model: GEN_MODEL.to_string(),
            embed_model: EMBED_MODEL.to_string(),
            embed_dimension: EMBED_DIMENSION,
            timeout: Duration::from_secs(PROVIDER_CALL_TIMEOUT_SECS),
        }
    }
}

impl OllamaConfig {
    /// Read `OLLAMA_URL`, `OLLAMA_GEN_MODEL`, `OLLAMA_EMBED_MODEL`,
    /// `OLLAMA_EMBED_DIM` and `PROVIDER_CALL_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            identity: defaults.identity,
            base_url: std::env::var("OLLAMA_URL").unwrap_or(defaults.base_url),
            gen_model: std::env::var("OLLAMA_GEN_MODEL").unwrap_or(defaults.gen_model),
            embed_model: std::env::var("OLLAMA_EMBED_MODEL").unwrap_or(defaults.embed_model),
            embed_dimension: std::env::var("OLLAMA_EMBED_DIM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.embed_dimension),
            timeout: std::env::var("PROVIDER_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_embed_dimension(mut self, dimension: usize) -> Self {
        self.embed_dimension = dimension;
        self
    }
}

/// Ollama provider for chat completions and embeddings.
pub struct OllamaProvider {
    client: Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = build_client(config.timeout)?;

        info!(
            subsystem = "inference",
            component = "ollama",
            url = %config.base_url,
            gen_model = %config.gen_model,
            embed_model = %config.embed_model,
            "Initializing Ollama provider"
        );

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(OllamaConfig::from_env())
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn chat(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        self.client
            .post(self.url("/api/chat"))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.config.identity, e))
    }
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    fn identity(&self) -> &str {
        &self.config.identity
    }

    #[instrument(skip(self, request), fields(subsystem = "inference", component = "ollama", op = "complete", model = %self.config.gen_model, message_count = request.messages.len()))]
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let start = Instant::now();
        let model = request.model.as_deref().unwrap_or(&self.config.gen_model);
        let body = ChatRequest {
            model,
            messages: &request.messages,
            stream: false,
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self.chat(&body).await?;
        let response = ensure_success(&self.config.identity, response).await?;
        let parsed: ChatResponse = response.json().await.map_err(|e| {
            Error::Inference(format!(
                "{}: failed to parse response: {}",
                self.config.identity, e
            ))
        })?;

        let content = parsed.message.content;
        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            response_len = content.len(),
            duration_ms = elapsed,
            "Generation complete"
        );
        if elapsed > 30_000 {
            warn!(duration_ms = elapsed, slow = true, "Slow generation operation");
        }

        Ok(InferenceResponse {
            content,
            provider: self.config.identity.clone(),
            model: model.to_string(),
        })
    }

    async fn probe(&self) -> Result<()> {
        let messages = [ChatMessage::user("Hi")];
        let body = ChatRequest {
            model: &self.config.gen_model,
            messages: &messages,
            stream: false,
            options: ChatOptions {
                temperature: Some(0.0),
                num_predict: Some(1),
            },
        };

        let status = self.chat(&body).await?.status();
        if service_answered(status) {
            debug!(
                subsystem = "inference",
                component = "ollama",
                op = "probe",
                status = status.as_u16(),
                "Probe answered"
            );
            Ok(())
        } else {
            warn!(
                subsystem = "inference",
                component = "ollama",
                op = "probe",
                status = status.as_u16(),
                "Probe failed"
            );
            Err(Error::Inference(format!(
                "{} probe returned {}",
                self.config.identity, status
            )))
        }
    }
}

#[async_trait]
impl Embedder for OllamaProvider {
    #[instrument(skip(self, text), fields(subsystem = "inference", component = "ollama", op = "embed", model = %self.config.embed_model, input_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let start = Instant::now();
        let request = EmbedRequest {
            model: &self.config.embed_model,
            input: [text],
        };

        let response = self
            .client
            .post(self.url("/api/embed"))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.config.identity, e))?;
        let response = ensure_success(&self.config.identity, response).await?;

        let parsed: EmbedResponse = response.json().await.map_err(|e| {
            Error::Inference(format!(
                "{}: failed to parse embedding response: {}",
                self.config.identity, e
            ))
        })?;

        let vector = parsed.embeddings.into_iter().next().ok_or_else(|| {
            Error::Inference(format!("{}: empty embedding response", self.config.identity))
        })?;

        if vector.len() != self.config.embed_dimension {
            return Err(Error::Fatal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.config.embed_dimension,
                vector.len()
            )));
        }

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Embedding complete"
        );
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.embed_dimension
    }
}

/// Request payload for the Ollama `/api/chat` endpoint.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Response from the Ollama `/api/chat` endpoint.
#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OllamaConfig::default();
        assert_eq!(config.identity, "ollama");
        assert_eq!(config.base_url, "http://ollama:11434");
        assert_eq!(config.embed_model, "nomic-embed-text");
        assert_eq!(config.embed_dimension, 768);
    }

    #[test]
    fn test_chat_request_maps_limits_to_options() {
        let messages = [ChatMessage::user("hi")];
        let body = ChatRequest {
            model: "llama3.1:8b",
            messages: &messages,
            stream: false,
            options: ChatOptions {
                temperature: Some(0.3),
                num_predict: Some(512),
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["options"]["num_predict"], 512);
        assert_eq!(json["stream"], false);
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_dimension_reported() {
        let provider =
            OllamaProvider::new(OllamaConfig::default().with_embed_dimension(384)).unwrap();
        assert_eq!(provider.dimension(), 384);
        assert_eq!(provider.identity(), "ollama");
    }
}
