use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmSettings;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Chat-completion client shared by the judge and the action interpreter.
/// Calls are bounded by the configured timeout and never run inside the
/// tick-critical path.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client from settings. Returns `None` when no API key is
    /// configured; callers fall back to their rule-based paths.
    pub fn from_settings(settings: &LlmSettings) -> Option<Self> {
        let api_key = settings.api_key.clone()?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_seconds))
            .build()
            .ok()?;
        Some(Self {
            http,
            api_url: settings.api_url.clone(),
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    pub async fn complete(&self, prompt: &str) -> CoreResult<String> {
        let payload = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CoreError::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Llm(format!(
                "request failed: {} - {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Llm(format!("malformed completion response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::Llm("completion response had no choices".into()))?;
        debug!(chars = content.len(), "received completion");
        Ok(content)
    }
}
