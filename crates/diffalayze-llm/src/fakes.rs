//! Scripted backend for tests (no network)

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{ChatMessage, ModelBackend};
use crate::error::LlmError;

type Responder = dyn Fn(usize, &[ChatMessage]) -> Result<String, LlmError> + Send + Sync;

/// Backend answering through a closure `(call_index, messages) -> reply`.
///
/// Every call's messages are recorded for later assertions.
pub struct ScriptedBackend {
    responder: Box<Responder>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    counter: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(usize, &[ChatMessage]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Same reply to every call.
    pub fn replying(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_, _| Ok(reply.clone()))
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Messages of every call so far, in call order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn call_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String, LlmError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        match self.calls.lock() {
            Ok(mut calls) => calls.push(messages.to_vec()),
            Err(poisoned) => poisoned.into_inner().push(messages.to_vec()),
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(index, messages)
    }
}
