//! Shared request/response plumbing for the HTTP backends.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::LlmError;

fn think_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<\s*think\s*>.*?<\s*/\s*think\s*>").ok())
        .as_ref()
}

/// Remove `<think>...</think>` reasoning blocks and leading whitespace.
pub fn strip_think(text: &str) -> String {
    match think_re() {
        Some(re) => re.replace_all(text, "").trim_start().to_string(),
        None => text.trim_start().to_string(),
    }
}

/// Parse a response body as JSON. Bodies carrying several JSON documents
/// (streamed chunks) are decoded from their last line.
pub fn parse_body(body: &str) -> Result<Value, LlmError> {
    if let Ok(value) = serde_json::from_str(body) {
        return Ok(value);
    }
    let last = body
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();
    serde_json::from_str(last).map_err(|e| LlmError::Response(format!("invalid JSON body: {e}")))
}

/// Text of an OpenAI-style chat completion: `choices[0].message.content`,
/// falling back to `choices[0].content`.
pub fn extract_chat_text(data: &Value) -> String {
    let choice = &data["choices"][0];
    choice["message"]["content"]
        .as_str()
        .or_else(|| choice["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

/// Concatenated text parts of an Anthropic messages response.
pub fn extract_anthropic_text(data: &Value) -> String {
    data["content"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// POST a JSON payload and parse the JSON reply.
pub(crate) async fn post_json<T: Serialize + ?Sized>(
    request: reqwest::RequestBuilder,
    payload: &T,
) -> Result<Value, LlmError> {
    let response = request.json(payload).send().await.map_err(|e| {
        if e.is_timeout() {
            LlmError::Http(format!("request timed out: {e}"))
        } else {
            LlmError::from(e)
        }
    })?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::Status {
            status: status.as_u16(),
            body,
        });
    }
    debug!(status = status.as_u16(), bytes = body.len(), "model response received");
    parse_body(&body)
}
