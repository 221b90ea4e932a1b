//! Provider for manually staged artifacts.
//!
//! Drop `old.<file>` and `new.<file>` into the target's `incoming/`
//! directory. The pair is reported once per distinct new-file digest.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{ArtifactPair, FetchOutcome, FetchProvider, ProviderError};
use crate::error::ConfigError;
use crate::target::{Target, TargetConfig};

pub const KIND: &str = "local";

#[derive(Debug, Clone, Deserialize)]
struct LocalParams {
    file_name: String,
    #[serde(default = "default_incoming")]
    incoming_dir: String,
}

fn default_incoming() -> String {
    "incoming".to_string()
}

/// Reports staged `old.*`/`new.*` files from a target-local directory.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    incoming: PathBuf,
    file_name: String,
    version_log: PathBuf,
}

impl LocalProvider {
    pub fn new(incoming: impl Into<PathBuf>, file_name: &str, version_log: impl Into<PathBuf>) -> Self {
        Self {
            incoming: incoming.into(),
            file_name: file_name.to_string(),
            version_log: version_log.into(),
        }
    }

    /// Build from `target.toml` params (`file_name`, optional `incoming_dir`).
    pub fn from_target(
        target: &Target,
        config: &TargetConfig,
    ) -> Result<Arc<dyn FetchProvider>, ConfigError> {
        let params: LocalParams =
            config
                .params_as()
                .map_err(|reason| ConfigError::InvalidTargetConfig {
                    path: target.config_path(),
                    reason,
                })?;
        Ok(Arc::new(Self::new(
            target.dir.join(params.incoming_dir),
            &params.file_name,
            target.version_log(),
        )))
    }

    fn staged(&self, prefix: &str) -> PathBuf {
        self.incoming.join(format!("{prefix}.{}", self.file_name))
    }
}

pub(crate) fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub(crate) fn read_version_log(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn write_version_log(path: &Path, version: &str) -> std::io::Result<()> {
    std::fs::write(path, format!("{version}\n"))
}

#[async_trait]
impl FetchProvider for LocalProvider {
    fn kind(&self) -> &str {
        KIND
    }

    async fn check_and_fetch(&self) -> Result<FetchOutcome, ProviderError> {
        let old = self.staged("old");
        let new = self.staged("new");
        if !old.is_file() || !new.is_file() {
            debug!(incoming = %self.incoming.display(), "no staged pair");
            return Ok(FetchOutcome::NoUpdate);
        }

        let digest = {
            let new = new.clone();
            tokio::task::spawn_blocking(move || sha256_file(&new))
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()))??
        };
        if read_version_log(&self.version_log)?.as_deref() == Some(digest.as_str()) {
            return Ok(FetchOutcome::NoUpdate);
        }

        write_version_log(&self.version_log, &digest)?;
        Ok(FetchOutcome::Pair(ArtifactPair::new(old, new)))
    }
}
