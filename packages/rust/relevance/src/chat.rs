//! Minimal OpenAI-compatible chat completions client.

use std::time::Duration;

use papermonitor_shared::{LlmSettings, PaperMonitorError, Result};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::USER_AGENT;

/// Endpoint and default model of a built-in provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderPreset {
    pub base_url: &'static str,
    pub model: &'static str,
}

impl ProviderPreset {
    pub fn for_provider(provider: &str) -> Option<Self> {
        match provider {
            "groq" => Some(Self {
                base_url: "https://api.groq.com/openai",
                model: "llama-3.1-8b-instant",
            }),
            "openai" => Some(Self {
                base_url: "https://api.openai.com",
                model: "gpt-4o-mini",
            }),
            _ => None,
        }
    }
}

/// Why a chat call failed. Every variant is a transport-level failure that
/// the caller may retry.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("reply contained no choices")]
    Empty,
}

impl ChatError {
    /// Server-requested wait, when the provider sent `Retry-After`.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Sends one system + user exchange and returns the assistant text.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl ChatClient {
    /// Build from provider settings, falling back to the provider preset
    /// for endpoint and model.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let preset = ProviderPreset::for_provider(&settings.provider);

        let base_url = settings
            .base_url
            .as_deref()
            .or(preset.map(|p| p.base_url))
            .ok_or_else(|| {
                PaperMonitorError::config(format!(
                    "LLM provider `{}` is not built in; set `base_url` in its fragment",
                    settings.provider
                ))
            })?;
        let model = settings
            .model
            .as_deref()
            .or(preset.map(|p| p.model))
            .ok_or_else(|| {
                PaperMonitorError::config(format!(
                    "LLM provider `{}` is not built in; set `model` in its fragment",
                    settings.provider
                ))
            })?;

        let api_key = settings.api_key.clone().filter(|k| !k.trim().is_empty());
        if api_key.is_none() && preset.is_some() {
            return Err(PaperMonitorError::config(format!(
                "missing API key for LLM provider `{0}` (set {1}_API_KEY or `api_key` in llm/{0}.yaml)",
                settings.provider,
                settings.provider.to_uppercase()
            )));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| PaperMonitorError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.to_string(),
            temperature: settings.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask for a JSON object reply to `system` + `user`.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> std::result::Result<String, ChatError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status {
                status,
                retry_after,
                body: truncate(&body, 200),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(format!("invalid response body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ChatError::Empty)?;

        debug!(chars = content.len(), "received chat completion");
        Ok(content)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
