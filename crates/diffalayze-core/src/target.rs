//! Monitored targets and their on-disk layout.
//!
//! A target is a directory under the targets root:
//!
//! ```text
//! targets/<name>/
//!   target.toml        provider selection and parameters
//!   version.log        provider-owned version tracking
//!   work/<job-id>/     diff working directories
//!   archive/           completed diffs
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Per-target configuration file name.
pub const TARGET_CONFIG_FILE: &str = "target.toml";
/// Provider version-tracking file name.
pub const VERSION_LOG_FILE: &str = "version.log";

/// Errors resolving targets.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("targets root not found: {0}")]
    RootMissing(PathBuf),

    #[error("target '{name}' is outside {root}")]
    OutsideRoot { name: String, root: PathBuf },

    #[error("target directory not found: {0}")]
    NotFound(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A monitored artifact family. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub dir: PathBuf,
}

impl Target {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(TARGET_CONFIG_FILE)
    }

    pub fn version_log(&self) -> PathBuf {
        self.dir.join(VERSION_LOG_FILE)
    }

    /// Parent of per-job working directories.
    pub fn work_root(&self) -> PathBuf {
        self.dir.join("work")
    }

    pub fn archive_root(&self) -> PathBuf {
        self.dir.join("archive")
    }

    /// Load `target.toml`, or `None` when the file does not exist.
    pub fn load_config(&self) -> Result<Option<TargetConfig>, ConfigError> {
        let path = self.config_path();
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        TargetConfig::parse(&text)
            .map(Some)
            .map_err(|reason| ConfigError::InvalidTargetConfig { path, reason })
    }

    /// Forget the last seen version so the provider fetches again.
    pub fn reset_version_tracking(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(self.version_log()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Parsed `target.toml`.
///
/// ```toml
/// provider = "winbindex"
///
/// [params]
/// file_name = "mrxsmb.sys"
/// windows_version = "11-24H2"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Provider kind, looked up in the provider registry.
    pub provider: String,

    /// Provider-specific parameters.
    #[serde(default)]
    pub params: toml::Table,
}

impl TargetConfig {
    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Deserialize `params` into a provider's typed settings.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e: toml::de::Error| e.to_string())
    }
}

/// Which targets a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    All,
    Named(String),
}

impl FromStr for TargetSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s == "all" {
            TargetSelector::All
        } else {
            TargetSelector::Named(s.to_string())
        })
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::All => f.write_str("all"),
            TargetSelector::Named(name) => f.write_str(name),
        }
    }
}

/// Enumerate every target directory under `root`, sorted by name.
pub fn discover_targets(root: &Path) -> Result<Vec<Target>, TargetError> {
    if !root.is_dir() {
        return Err(TargetError::RootMissing(root.to_path_buf()));
    }
    let mut targets = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        // Hidden directories hold shared provider state, e.g. `.winbindex`.
        if name.starts_with('.') {
            continue;
        }
        targets.push(Target::new(name, entry.path()));
    }
    targets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(targets)
}

/// Resolve one target name relative to `root`, refusing paths that escape it.
pub fn resolve_target(root: &Path, name: &str) -> Result<Target, TargetError> {
    let candidate = Path::new(name);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes || name.is_empty() {
        return Err(TargetError::OutsideRoot {
            name: name.to_string(),
            root: root.to_path_buf(),
        });
    }

    let dir = root.join(candidate);
    if !dir.is_dir() {
        return Err(TargetError::NotFound(dir));
    }
    let target_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    Ok(Target::new(target_name, dir))
}

/// Apply a selector.
pub fn select_targets(root: &Path, selector: &TargetSelector) -> Result<Vec<Target>, TargetError> {
    match selector {
        TargetSelector::All => discover_targets(root),
        TargetSelector::Named(name) => resolve_target(root, name).map(|t| vec![t]),
    }
}
