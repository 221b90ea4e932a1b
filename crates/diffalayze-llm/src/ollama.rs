//! Local inference through ollama's OpenAI-compatible endpoint.

use async_trait::async_trait;
use serde::Serialize;

use crate::backend::{ChatMessage, ModelBackend};
use crate::error::LlmError;
use crate::response::{extract_chat_text, post_json};

pub const DEFAULT_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen3:32b";

/// Request body for `/v1/chat/completions`
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(client: reqwest::Client, base_url: &str, model: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            stream: false,
        };
        let data = post_json(self.client.post(self.endpoint()), &body)
            .await
            .map_err(|e| match e {
                LlmError::Http(msg) => LlmError::Http(format!("{} ({msg})", self.base_url)),
                other => other,
            })?;
        Ok(extract_chat_text(&data))
    }
}
