//! Fetch providers: per-target discovery of new artifact version pairs.
//!
//! Each target is bound to one [`FetchProvider`]. Providers own their own
//! version tracking and must not report the same pair twice for an
//! unchanged latest version.

pub mod local;
pub mod winbindex;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::target::{Target, TargetConfig};

pub use local::LocalProvider;
pub use winbindex::WinbindexProvider;

/// An old/new artifact pair ready for diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPair {
    pub old: PathBuf,
    pub new: PathBuf,
}

impl ArtifactPair {
    pub fn new(old: impl Into<PathBuf>, new: impl Into<PathBuf>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    /// Both paths must name existing, distinct files.
    pub fn validate(&self) -> Result<(), ProviderError> {
        for path in [&self.old, &self.new] {
            if !path.is_file() {
                return Err(ProviderError::MissingArtifact(path.clone()));
            }
        }
        if self.old == self.new {
            return Err(ProviderError::Malformed(format!(
                "old and new artifact are the same file: {}",
                self.old.display()
            )));
        }
        Ok(())
    }
}

/// What a provider found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Nothing new since the last run.
    NoUpdate,
    /// A new version pair is on disk.
    Pair(ArtifactPair),
}

/// Provider-side failures. Isolated to the target that produced them.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("version data unavailable: {0}")]
    VersionData(String),

    #[error("artifact missing on disk: {0}")]
    MissingArtifact(PathBuf),

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    Checksum {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("malformed provider result: {0}")]
    Malformed(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::VersionData(err.to_string())
    }
}

/// Contract every target's provider satisfies.
#[async_trait]
pub trait FetchProvider: Send + Sync {
    /// Short provider kind, for logs.
    fn kind(&self) -> &str;

    /// Check for a new version and download it if there is one.
    async fn check_and_fetch(&self) -> Result<FetchOutcome, ProviderError>;
}

/// Builds a provider for a target from its `target.toml`.
pub type ProviderFactory =
    fn(&Target, &TargetConfig) -> Result<Arc<dyn FetchProvider>, ConfigError>;

/// Static provider lookup keyed on target name, then on provider kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    bound: HashMap<String, Arc<dyn FetchProvider>>,
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in provider kinds.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_kind(winbindex::KIND, WinbindexProvider::from_target);
        registry.register_kind(local::KIND, LocalProvider::from_target);
        registry
    }

    /// Register a factory for a `provider = "<kind>"` entry.
    pub fn register_kind(&mut self, kind: &str, factory: ProviderFactory) -> &mut Self {
        self.factories.insert(kind.to_string(), factory);
        self
    }

    /// Bind a provider instance to one target name. Takes precedence over
    /// `target.toml`.
    pub fn bind(&mut self, target: &str, provider: Arc<dyn FetchProvider>) -> &mut Self {
        self.bound.insert(target.to_string(), provider);
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Provider for `target`, or `None` when the target has no binding and
    /// no `target.toml`.
    pub fn resolve(&self, target: &Target) -> Result<Option<Arc<dyn FetchProvider>>, ConfigError> {
        if let Some(provider) = self.bound.get(&target.name) {
            return Ok(Some(Arc::clone(provider)));
        }
        let Some(config) = target.load_config()? else {
            return Ok(None);
        };
        let factory = self
            .factories
            .get(&config.provider)
            .ok_or_else(|| ConfigError::UnknownProvider {
                target: target.name.clone(),
                kind: config.provider.clone(),
            })?;
        factory(target, &config).map(Some)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bound: Vec<&String> = self.bound.keys().collect();
        bound.sort();
        f.debug_struct("ProviderRegistry")
            .field("bound", &bound)
            .field("kinds", &self.kinds())
            .finish()
    }
}
