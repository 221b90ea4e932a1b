//! Backend contract, selection and credential lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::anthropic::AnthropicBackend;
use crate::error::LlmError;
use crate::ollama::OllamaBackend;
use crate::openai::OpenAiBackend;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    OpenAi,
    Anthropic,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
            BackendKind::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "openai" => Ok(BackendKind::OpenAi),
            "anthropic" => Ok(BackendKind::Anthropic),
            other => Err(LlmError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// A stateless request/response wrapper around one model endpoint.
///
/// Implementations return the raw response text; think-block stripping and
/// structured decoding happen in [`crate::ModelClient`].
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Model identifier sent with each request.
    fn model(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage], temperature: f32)
        -> Result<String, LlmError>;
}

/// Backend selection as given on the command line.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    /// Model override; each backend has its own default.
    pub model: Option<String>,
    pub temperature: f32,
    /// HTTP request timeout.
    pub timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Ollama,
            model: None,
            temperature: 0.7,
            timeout: Duration::from_secs(600),
        }
    }
}

/// First non-empty value among `vars`.
pub(crate) fn first_var(lookup: &dyn Fn(&str) -> Option<String>, vars: &[&str]) -> Option<String> {
    vars.iter()
        .filter_map(|v| lookup(v))
        .find(|value| !value.trim().is_empty())
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .user_agent(concat!("diffalayze/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(LlmError::from)
}

/// Build the selected backend, resolving endpoints and credentials through
/// `lookup`.
///
/// A hosted backend without its API key fails here, before any work starts.
pub fn build_backend(
    settings: &BackendSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn ModelBackend>, LlmError> {
    let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
    let client = http_client(settings.timeout)?;
    let backend: Arc<dyn ModelBackend> = match settings.kind {
        BackendKind::Ollama => {
            let base = first_var(lookup, &["OLLAMA_URL"])
                .unwrap_or_else(|| crate::ollama::DEFAULT_URL.to_string());
            let model = settings
                .model
                .clone()
                .or_else(|| first_var(lookup, &["OLLAMA_MODEL"]))
                .unwrap_or_else(|| crate::ollama::DEFAULT_MODEL.to_string());
            Arc::new(OllamaBackend::new(client, &base, model))
        }
        BackendKind::OpenAi => {
            let vars = vec!["OPENAI_API_KEY", "OPENAI_KEY"];
            let key = first_var(lookup, &vars).ok_or(LlmError::MissingCredential {
                backend: "openai",
                vars,
            })?;
            let model = settings
                .model
                .clone()
                .unwrap_or_else(|| crate::openai::DEFAULT_MODEL.to_string());
            Arc::new(OpenAiBackend::new(client, key, model))
        }
        BackendKind::Anthropic => {
            let vars = vec!["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"];
            let key = first_var(lookup, &vars).ok_or(LlmError::MissingCredential {
                backend: "anthropic",
                vars,
            })?;
            let model = settings
                .model
                .clone()
                .unwrap_or_else(|| crate::anthropic::DEFAULT_MODEL.to_string());
            Arc::new(AnthropicBackend::new(client, key, model))
        }
    };
    Ok(backend)
}

/// [`build_backend`] against the process environment.
pub fn from_env(settings: &BackendSettings) -> Result<Arc<dyn ModelBackend>, LlmError> {
    build_backend(settings, |var| std::env::var(var).ok())
}
