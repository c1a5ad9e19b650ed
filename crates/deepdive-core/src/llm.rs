//! Narrow language-model capability plus helpers for treating model output
//! as untrusted input.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::security::SecretValue;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError>;
}

pub type DynLanguageModel = Arc<dyn LanguageModel>;

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretValue>,
    timeout: Duration,
}

impl OpenAiCompatibleClient {
    pub fn new(client: Client, config: &LlmConfig, api_key: Option<SecretValue>) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            model: config.model.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleClient {
    #[tracing::instrument(name = "llm.complete", skip(self, prompt), fields(model = %self.model, prompt_chars = prompt.len()))]
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            temperature: 0.2,
        };

        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(LlmError::Timeout);
        }
        if !status.is_success() {
            return Err(LlmError::Unavailable(format!("HTTP {status}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Unavailable(format!("malformed completion: {err}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(LlmError::Unavailable("empty completion".into()));
        }
        Ok(text)
    }
}

static THINKING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("invalid thinking regex"));
static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("invalid fence regex")
});

/// Remove `<think>...</think>` reasoning blocks some models emit.
pub fn strip_thinking_tokens(text: &str) -> String {
    THINKING.replace_all(text, "").trim().to_string()
}

/// Pull the first JSON value out of a model reply, tolerating reasoning
/// blocks, code fences and surrounding prose. Returns `None` when nothing
/// parses.
pub fn extract_json(text: &str) -> Option<Value> {
    let cleaned = strip_thinking_tokens(text);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Some(value);
    }
    if let Some(inner) = FENCE.captures(&cleaned).and_then(|caps| caps.get(1)) {
        if let Ok(value) = serde_json::from_str::<Value>(inner.as_str().trim()) {
            return Some(value);
        }
    }
    // Widest bracketed span, starting from whichever bracket opens first.
    let mut spans: Vec<(usize, char, char)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| cleaned.find(open).map(|start| (start, open, close)))
        .collect();
    spans.sort_unstable();
    for (start, _, close) in spans {
        if let Some(end) = cleaned.rfind(close) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&cleaned[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_reasoning_blocks() {
        let raw = "<think>plan the answer\nstep 2</think>\nFinal text";
        assert_eq!(strip_thinking_tokens(raw), "Final text");
    }

    #[test]
    fn extracts_fenced_json() {
        let raw = "Sure!\n```json\n{\"done\": true}\n```";
        assert_eq!(extract_json(raw), Some(json!({"done": true})));
    }

    #[test]
    fn extracts_embedded_array() {
        let raw = "<think>x</think> here you go: [{\"query\": \"a\"}] thanks";
        assert_eq!(extract_json(raw), Some(json!([{"query": "a"}])));
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(extract_json("no structured output here"), None);
    }
}
