//! OpenAI-compatible chat backend (vLLM and friends).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use agential_core::defaults::{GEN_MODEL, PROVIDER_CALL_TIMEOUT_SECS, VLLM_URL};
use agential_core::{
    ChatMessage, Error, InferenceProvider, InferenceRequest, InferenceResponse, Result,
};

use crate::http::{build_client, ensure_success, service_answered, transport_error};

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Identity used in logs, errors and endpoint bookkeeping.
    pub identity: String,
    /// Server root; `/v1/chat/completions` is appended.
    pub base_url: String,
    /// Model to request when the call does not name one.
    pub model: String,
    /// Bearer token, if the server requires one.
    pub api_key: Option<String>,
    /// Client-level request timeout.
    pub timeout: Duration,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            identity: "vllm".to_string(),
            base_url: VLLM_URL.to_string(),
            model: GEN_MODEL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(PROVIDER_CALL_TIMEOUT_SECS),
        }
    }
}

impl OpenAiCompatConfig {
    /// Read `VLLM_URL`, `VLLM_MODEL`, `VLLM_API_KEY` and
    /// `PROVIDER_CALL_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            identity: defaults.identity,
            base_url: std::env::var("VLLM_URL").unwrap_or(defaults.base_url),
            model: std::env::var("VLLM_MODEL").unwrap_or(defaults.model),
            api_key: std::env::var("VLLM_API_KEY").ok().filter(|k| !k.is_empty()),
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

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }
}

/// OpenAI-compatible chat completion provider.
pub struct OpenAiCompatProvider {
    client: Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let client = build_client(config.timeout)?;

        info!(
            subsystem = "inference",
            component = "openai_compat",
            provider = %config.identity,
            url = %config.base_url,
            model = %config.model,
            "Initializing OpenAI-compatible provider"
        );

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiCompatConfig::from_env())
    }

    pub fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn post(&self, body: &ChatCompletionRequest<'_>) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.endpoint()).json(body);
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatProvider {
    fn identity(&self) -> &str {
        &self.config.identity
    }

    #[instrument(skip(self, request), fields(subsystem = "inference", component = "openai_compat", op = "complete", provider = %self.config.identity, message_count = request.messages.len()))]
    async fn complete(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let start = Instant::now();
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let body = ChatCompletionRequest {
            model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.config.identity, e))?;
        let response = ensure_success(&self.config.identity, response).await?;

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            Error::Inference(format!(
                "{}: failed to parse response: {}",
                self.config.identity, e
            ))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            Error::Inference(format!("{}: response had no choices", self.config.identity))
        })?;

        let content = choice.message.content.unwrap_or_default();
        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            response_len = content.len(),
            duration_ms = elapsed,
            "Completion finished"
        );

        Ok(InferenceResponse {
            content,
            provider: self.config.identity.clone(),
            model: parsed.model.unwrap_or_else(|| model.to_string()),
        })
    }

    async fn probe(&self) -> Result<()> {
        let messages = [ChatMessage::user("Hi")];
        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: &messages,
            max_tokens: Some(1),
            temperature: Some(0.0),
            stream: false,
        };

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.config.identity, e))?;

        let status = response.status();
        if service_answered(status) {
            debug!(
                subsystem = "inference",
                component = "openai_compat",
                op = "probe",
                provider = %self.config.identity,
                status = status.as_u16(),
                "Probe answered"
            );
            Ok(())
        } else {
            warn!(
                subsystem = "inference",
                component = "openai_compat",
                op = "probe",
                provider = %self.config.identity,
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

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}
