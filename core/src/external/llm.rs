//! External LLM client contract (spec.md §6): `{prompt, system, max_tokens, temperature,
//! timeout, format_json?, think?} -> String`, degrading to empty string on error rather
//! than propagating (callers decide how to degrade).

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct LlmRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Ask the model to return strict JSON; caller still performs three-layer
    /// extraction (raw parse -> fence-strip -> bracket-match) regardless.
    pub format_json: bool,
    /// Requests extended reasoning when the backend supports it; ignored otherwise.
    pub think: bool,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: 1024,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
            format_json: false,
            think: false,
        }
    }
}

/// Extracts a JSON value from an LLM response using three progressively looser
/// strategies, returning `None` only if all three fail (spec.md §6 LLM client
/// contract).
pub fn extract_json(raw: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(raw.trim()) {
        return Some(v);
    }
    let fence_stripped = strip_code_fences(raw);
    if let Ok(v) = serde_json::from_str(fence_stripped.trim()) {
        return Some(v);
    }
    bracket_match(raw).and_then(|s| serde_json::from_str(&s).ok())
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        rest.strip_suffix("```").unwrap_or(rest).to_string()
    } else {
        trimmed.to_string()
    }
}

fn bracket_match(raw: &str) -> Option<String> {
    let start = raw.find(['{', '['])?;
    let open = raw.as_bytes()[start] as char;
    let close = if open == '{' { '}' } else { ']' };
    let mut depth = 0i32;
    for (i, c) in raw[start..].char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(raw[start..start + i + c.len_utf8()].to_string());
            }
        }
    }
    None
}

/// Thin, string-in/string-out LLM seam: one call per classification/synthesis
/// decision in the Pulse Executor, Curiosity Driver, and Healer.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> String;
}

pub struct OpenAiCompatClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(model: impl Into<String>, base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(base) = base_url {
            config = config.with_api_base(base);
        }
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }
        Self { client: Client::with_config(config), model: model.into() }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: LlmRequest) -> String {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage::from(system.as_str())));
        }
        messages.push(ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage::from(request.prompt.as_str())));

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone());
        args.messages(messages);
        args.max_tokens(request.max_tokens);
        args.temperature(request.temperature);
        let built = match args.build() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to build chat completion request");
                return String::new();
            }
        };

        debug!(model = %self.model, max_tokens = request.max_tokens, "llm call");
        let call = self.client.chat().create(built);
        match tokio::time::timeout(request.timeout, call).await {
            Ok(Ok(response)) => response
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default(),
            Ok(Err(e)) => {
                warn!(error = %e, "llm call failed");
                String::new()
            }
            Err(_) => {
                warn!(timeout_secs = request.timeout.as_secs(), "llm call timed out");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_parses_raw() {
        let v = extract_json(r#"{"a":1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn extract_json_strips_fences() {
        let v = extract_json("```json\n{\"a\":2}\n```").unwrap();
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn extract_json_bracket_matches_embedded() {
        let v = extract_json("here is the answer: {\"a\":3} thanks").unwrap();
        assert_eq!(v["a"], 3);
    }

    #[test]
    fn extract_json_returns_none_for_prose() {
        assert!(extract_json("no json here at all").is_none());
    }
}
