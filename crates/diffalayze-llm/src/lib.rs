//! Model backends for diffalayze
//!
//! Three interchangeable backends are selected by name: a local ollama
//! server and the OpenAI and Anthropic hosted APIs. [`ModelClient`] adds
//! think-block stripping, deadlines, cancellation and structured decoding.

pub mod anthropic;
pub mod backend;
pub mod client;
pub mod error;
pub mod fakes;
pub mod ollama;
pub mod openai;
pub mod response;

pub use backend::{
    build_backend, from_env, BackendKind, BackendSettings, ChatMessage, ModelBackend, Role,
};
pub use client::ModelClient;
pub use error::LlmError;
pub use response::strip_think;

/// Result type for model calls
pub type Result<T> = std::result::Result<T, LlmError>;
