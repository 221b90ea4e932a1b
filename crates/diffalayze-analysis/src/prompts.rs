//! Prompt configuration.
//!
//! ```yaml
//! prompts:
//!   per_doc:
//!     system: "..."
//!     user: "..."
//!   final_synthesis: { system: "...", user: "..." }
//!   evaluation: { system: "...", user: "..." }
//! ```

use diffalayze_llm::ChatMessage;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("cannot read prompt file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid prompt file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("prompt file has no top-level 'prompts' mapping")]
    MissingRoot,

    #[error("prompt '{0}' is not defined")]
    MissingPrompt(&'static str),
}

/// System and user instructions for one model call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub user: String,
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// System message plus the user instructions followed by `body`.
    pub fn messages(&self, body: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system.clone()),
            ChatMessage::user(format!("{}\n\n{}", self.user, body)),
        ]
    }
}

#[derive(Deserialize)]
struct RawPrompts {
    per_doc: Option<PromptTemplate>,
    final_synthesis: Option<PromptTemplate>,
    evaluation: Option<PromptTemplate>,
}

/// The three prompts the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub per_doc: PromptTemplate,
    pub final_synthesis: PromptTemplate,
    pub evaluation: PromptTemplate,
}

impl PromptSet {
    pub fn parse(text: &str) -> Result<Self, PromptError> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
        let root = doc
            .as_mapping()
            .and_then(|m| m.get("prompts"))
            .filter(|v| v.is_mapping())
            .ok_or(PromptError::MissingRoot)?;
        let raw: RawPrompts = serde_yaml::from_value(root.clone())?;
        Ok(Self {
            per_doc: raw.per_doc.ok_or(PromptError::MissingPrompt("per_doc"))?,
            final_synthesis: raw
                .final_synthesis
                .ok_or(PromptError::MissingPrompt("final_synthesis"))?,
            evaluation: raw.evaluation.ok_or(PromptError::MissingPrompt("evaluation"))?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, PromptError> {
        let text = std::fs::read_to_string(path).map_err(|source| PromptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }
}
