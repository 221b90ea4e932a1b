//! `call` / `call_json` on top of a backend, with deadlines and
//! cancellation.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use diffalayze_core::decode_object;

use crate::backend::{ChatMessage, ModelBackend};
use crate::error::LlmError;
use crate::response::strip_think;

/// Handle used by the analysis pipeline for every model call.
#[derive(Clone)]
pub struct ModelClient {
    backend: Arc<dyn ModelBackend>,
    temperature: f32,
    call_timeout: Option<Duration>,
}

impl ModelClient {
    pub fn new(backend: Arc<dyn ModelBackend>, temperature: f32) -> Self {
        Self {
            backend,
            temperature,
            call_timeout: None,
        }
    }

    /// Deadline applied to each call on top of the HTTP client's own timeout.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// One model call. Returns the response text without think blocks.
    pub async fn call(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let start = Instant::now();
        let request = self.backend.complete(messages, self.temperature);
        let bounded = async {
            match self.call_timeout {
                Some(limit) => tokio::time::timeout(limit, request)
                    .await
                    .map_err(|_| LlmError::Timeout(limit.as_secs()))?,
                None => request.await,
            }
        };
        let raw = tokio::select! {
            result = bounded => result?,
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        };
        debug!(
            backend = self.backend.name(),
            model = self.backend.model(),
            messages = messages.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "model call completed"
        );
        Ok(strip_think(&raw))
    }

    /// A call whose answer must be a single JSON object, possibly wrapped in
    /// string layers.
    pub async fn call_json(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<Map<String, Value>, LlmError> {
        let text = self.call(messages, cancel).await?;
        Ok(decode_object(text.trim())?)
    }
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("backend", &self.backend.name())
            .field("model", &self.backend.model())
            .field("temperature", &self.temperature)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
