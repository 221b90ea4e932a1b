//! OpenAI chat completions.

use async_trait::async_trait;
use serde::Serialize;

use crate::backend::{ChatMessage, ModelBackend};
use crate::error::LlmError;
use crate::response::{extract_chat_text, post_json};

pub const ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "o4-mini";

/// Reasoning models only accept the default temperature.
const FIXED_TEMPERATURE: f32 = 1.0;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(client: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: FIXED_TEMPERATURE,
        };
        let request = self.client.post(ENDPOINT).bearer_auth(&self.api_key);
        let data = post_json(request, &body).await?;
        Ok(extract_chat_text(&data))
    }
}
