//! Error types for model backends

use diffalayze_core::DecodeError;
use thiserror::Error;

/// Errors raised while talking to a model backend.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Backend name not one of ollama, openai, anthropic
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Required credential absent from the environment
    #[error("{backend} credential not set (expected one of: {})", vars.join(", "))]
    MissingCredential {
        backend: &'static str,
        vars: Vec<&'static str>,
    },

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-2xx response
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body could not be understood
    #[error("unexpected response: {0}")]
    Response(String),

    /// Structured output could not be decoded into an object
    #[error("structured output: {0}")]
    Decode(#[from] DecodeError),

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("model call cancelled")]
    Cancelled,
}

impl LlmError {
    /// Configuration-level errors abort a run before any work starts.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            LlmError::UnsupportedBackend(_) | LlmError::MissingCredential { .. }
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credential_lists_vars() {
        let err = LlmError::MissingCredential {
            backend: "anthropic",
            vars: vec!["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"],
        };
        assert_eq!(
            err.to_string(),
            "anthropic credential not set (expected one of: ANTHROPIC_API_KEY, CLAUDE_API_KEY)"
        );
        assert!(err.is_config());
        assert!(!LlmError::Timeout(5).is_config());
    }
}
