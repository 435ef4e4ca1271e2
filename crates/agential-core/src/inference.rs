//! Inference request/response types and provider endpoint bookkeeping.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared role of an endpoint. Exactly one endpoint is primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Primary,
    Secondary,
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderRole::Primary => f.write_str("primary"),
            ProviderRole::Secondary => f.write_str("secondary"),
        }
    }
}

/// Last observed health of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    /// Never probed.
    #[default]
    Unknown,
    Healthy,
    /// A live call failed but the endpoint has not failed a probe.
    Degraded,
    Down,
}

impl ProviderHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderHealth::Unknown => "unknown",
            ProviderHealth::Healthy => "healthy",
            ProviderHealth::Degraded => "degraded",
            ProviderHealth::Down => "down",
        }
    }
}

impl fmt::Display for ProviderHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router-owned view of one inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub identity: String,
    pub role: ProviderRole,
    pub health: ProviderHealth,
    pub last_probed_at: Option<DateTime<Utc>>,
}

impl ProviderEndpoint {
    pub fn new(identity: impl Into<String>, role: ProviderRole) -> Self {
        Self {
            identity: identity.into(),
            role,
            health: ProviderHealth::Unknown,
            last_probed_at: None,
        }
    }
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request, independent of the serving backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    /// Overrides the provider's configured model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl InferenceRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Single user-message request.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(text)])
    }

    /// Minimal 1-token request used to check that an endpoint answers.
    pub fn probe() -> Self {
        Self::prompt("ping").with_max_tokens(1)
    }

    pub fn with_system(mut self, text: impl Into<String>) -> Self {
        self.messages.insert(0, ChatMessage::system(text));
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Completed inference result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub content: String,
    /// Identity of the endpoint that served the call.
    pub provider: String,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_starts_unknown() {
        let ep = ProviderEndpoint::new("vllm", ProviderRole::Primary);
        assert_eq!(ep.health, ProviderHealth::Unknown);
        assert!(ep.last_probed_at.is_none());
    }

    #[test]
    fn test_request_builder() {
        let req = InferenceRequest::prompt("summarize this")
            .with_system("You are terse.")
            .with_max_tokens(512)
            .with_temperature(0.3);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].content, "summarize this");
        assert_eq!(req.max_tokens, Some(512));
    }

    #[test]
    fn test_probe_request_is_one_token() {
        assert_eq!(InferenceRequest::probe().max_tokens, Some(1));
    }

    #[test]
    fn test_health_display() {
        assert_eq!(ProviderHealth::Degraded.to_string(), "degraded");
        assert_eq!(ProviderRole::Secondary.to_string(), "secondary");
    }
}
