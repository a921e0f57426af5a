//! Reasoning collaborator: trait, HTTP client and reply parsing

use crate::redact::Redactor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Error)]
pub enum ReasonError {
    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),
    #[error("reasoning request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("reasoning API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("reasoning API returned no text")]
    EmptyResponse,
    #[error("ANTHROPIC_API_KEY is not set")]
    MissingApiKey,
    #[error("unusable reasoning reply: {0}")]
    Malformed(String),
}

/// Text completion used for chunk analysis, synthesis and hypothesis work
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String, ReasonError>;
}

/// `complete` bounded by `timeout`; expiry is reported as a failure, never a hang
pub async fn complete_within(
    reasoner: &dyn Reasoner,
    prompt: &str,
    temperature: f32,
    timeout: Duration,
) -> Result<String, ReasonError> {
    match tokio::time::timeout(timeout, reasoner.complete(prompt, temperature)).await {
        Ok(result) => result,
        Err(_) => Err(ReasonError::Timeout(timeout)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerSettings {
    /// Model identifier sent with every request
    pub model: String,
    /// Completion length cap
    pub max_tokens: u32,
    /// Messages endpoint
    pub api_url: String,
}

impl ReasonerSettings {
    pub fn new() -> Self {
        Self {
            model: "claude-3-haiku-20240307".to_string(),
            max_tokens: 2048,
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
        }
    }
}

impl Default for ReasonerSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Messages-API backed reasoner. Prompts are redacted before they are sent.
pub struct AnthropicReasoner {
    client: reqwest::Client,
    api_key: String,
    settings: ReasonerSettings,
    redactor: Redactor,
}

impl AnthropicReasoner {
    pub fn new(api_key: impl Into<String>, settings: ReasonerSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            settings,
            redactor: Redactor::new(),
        }
    }

    fn request_body(&self, prompt: &str, temperature: f32) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": temperature,
            "messages": [{"role": "user", "content": self.redactor.redact(prompt)}]
        })
    }

    /// Build from `ANTHROPIC_API_KEY`
    pub fn from_env(settings: ReasonerSettings) -> Result<Self, ReasonError> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key, settings)),
            _ => Err(ReasonError::MissingApiKey),
        }
    }
}

#[async_trait]
impl Reasoner for AnthropicReasoner {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String, ReasonError> {
        let response = self
            .client
            .post(&self.settings.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&self.request_body(prompt, temperature))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasonError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await?;
        let text = body["content"][0]["text"].as_str().unwrap_or("").trim();
        if text.is_empty() {
            return Err(ReasonError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}

/// Pull a JSON object out of a model reply: bare JSON, a fenced block, or the first balanced `{...}`
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in trimmed[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&trimmed[start..start + offset + 1]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// String array field of a JSON object; missing or mistyped fields read as empty
pub fn string_list(value: &serde_json::Value, key: &str) -> Vec<String> {
    value[key]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s.trim().to_string()),
                    serde_json::Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
