//! Anthropic messages API.

use async_trait::async_trait;
use serde::Serialize;

use crate::backend::{ChatMessage, ModelBackend, Role};
use crate::error::LlmError;
use crate::response::{extract_anthropic_text, post_json};

pub const ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-opus-4-0";
pub const MAX_TOKENS: u32 = 8192;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

/// Lift a leading system message into the request's `system` field.
fn split_system(messages: &[ChatMessage]) -> (Option<&str>, &[ChatMessage]) {
    match messages.split_first() {
        Some((first, rest)) if first.role == Role::System => (Some(first.content.as_str()), rest),
        _ => (None, messages),
    }
}

pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicBackend {
    pub fn new(client: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, LlmError> {
        let (system, messages) = split_system(messages);
        let body = MessagesRequest {
            model: &self.model,
            system,
            messages,
            temperature,
            max_tokens: MAX_TOKENS,
        };
        let request = self
            .client
            .post(ENDPOINT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION);
        let data = post_json(request, &body).await?;
        Ok(extract_anthropic_text(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_lifted_out() {
        let messages = vec![ChatMessage::system("rules"), ChatMessage::user("diff")];
        let (system, rest) = split_system(&messages);
        assert_eq!(system, Some("rules"));
        assert_eq!(rest, &messages[1..]);

        let body = MessagesRequest {
            model: DEFAULT_MODEL,
            system,
            messages: rest,
            temperature: 0.7,
            max_tokens: MAX_TOKENS,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "rules");
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["max_tokens"], 8192);
    }

    #[test]
    fn test_no_leading_system() {
        let messages = vec![ChatMessage::user("diff"), ChatMessage::system("late")];
        let (system, rest) = split_system(&messages);
        assert!(system.is_none());
        assert_eq!(rest.len(), 2);

        let body = MessagesRequest {
            model: DEFAULT_MODEL,
            system,
            messages: rest,
            temperature: 0.7,
            max_tokens: MAX_TOKENS,
        };
        assert!(serde_json::to_value(&body).unwrap().get("system").is_none());
    }
}
