//! Windows binaries tracked through the winbindex index.
//!
//! The index repository publishes, per file name, a gzip'd JSON map of
//! `sha256 -> { fileInfo, windowsVersions }`. The two newest builds for the
//! configured Windows version are downloaded from the Microsoft symbol
//! server.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::local::{read_version_log, write_version_log};
use super::{ArtifactPair, FetchOutcome, FetchProvider, ProviderError};
use crate::error::ConfigError;
use crate::process::{run_process, OutputMode, ProcessSpec};
use crate::target::{Target, TargetConfig};

pub const KIND: &str = "winbindex";

pub const DEFAULT_REPO_URL: &str = "https://github.com/m417z/winbindex.git";
pub const DEFAULT_BRANCH: &str = "gh-pages";
const SYMBOL_SERVER: &str = "https://msdl.microsoft.com/download/symbols";
const INDEX_SUBDIR: &str = "data/by_filename_compressed";
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for cloning or pulling the index.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Deserialize)]
struct WinbindexParams {
    file_name: String,
    windows_version: String,
    db_file: Option<String>,
    repo_dir: Option<PathBuf>,
    #[serde(default = "default_repo_url")]
    repo_url: String,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default = "default_verify")]
    verify_sha256: bool,
    #[serde(default = "default_git_timeout")]
    git_timeout_secs: u64,
}

fn default_repo_url() -> String {
    DEFAULT_REPO_URL.to_string()
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_verify() -> bool {
    true
}

fn default_git_timeout() -> u64 {
    DEFAULT_GIT_TIMEOUT.as_secs()
}

/// One indexed build of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedVersion {
    pub sha256: String,
    pub timestamp: u64,
    pub virtual_size: u64,
}

impl IndexedVersion {
    pub fn url(&self, file_name: &str) -> String {
        symbol_url(file_name, self.timestamp, self.virtual_size)
    }
}

/// Symbol server URL: `<file>/<TIMESTAMP><SIZE>/<file>`, both upper-case hex.
pub fn symbol_url(file_name: &str, timestamp: u64, virtual_size: u64) -> String {
    format!("{SYMBOL_SERVER}/{file_name}/{timestamp:X}{virtual_size:X}/{file_name}")
}

/// Builds of the index that ship in `windows_version`, newest first.
pub fn select_versions(index: &Value, windows_version: &str) -> Vec<IndexedVersion> {
    let Some(entries) = index.as_object() else {
        return Vec::new();
    };
    let mut versions: Vec<IndexedVersion> = entries
        .iter()
        .filter_map(|(sha256, entry)| {
            let info = entry.get("fileInfo")?;
            let timestamp = info.get("timestamp")?.as_u64().filter(|t| *t > 0)?;
            let virtual_size = info.get("virtualSize")?.as_u64().filter(|s| *s > 0)?;
            entry
                .get("windowsVersions")?
                .as_object()?
                .contains_key(windows_version)
                .then(|| IndexedVersion {
                    sha256: sha256.clone(),
                    timestamp,
                    virtual_size,
                })
        })
        .collect();
    versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    versions
}

/// Read and parse a gzip'd JSON index file.
pub fn load_index(path: &Path) -> Result<Value, ProviderError> {
    let file = std::fs::File::open(path).map_err(|e| {
        ProviderError::VersionData(format!("cannot open index {}: {e}", path.display()))
    })?;
    let mut text = String::new();
    GzDecoder::new(file).read_to_string(&mut text)?;
    Ok(serde_json::from_str(&text)?)
}

/// Tracks one Windows binary via winbindex.
#[derive(Debug, Clone)]
pub struct WinbindexProvider {
    file_name: String,
    windows_version: String,
    db_file: String,
    repo_dir: PathBuf,
    repo_url: String,
    branch: String,
    verify_sha256: bool,
    git_timeout: Duration,
    download_dir: PathBuf,
    version_log: PathBuf,
    http: reqwest::Client,
}

impl WinbindexProvider {
    /// Build from `target.toml` params.
    ///
    /// The index clone defaults to `.winbindex` next to the target
    /// directories so every winbindex target shares it.
    pub fn from_target(
        target: &Target,
        config: &TargetConfig,
    ) -> Result<Arc<dyn FetchProvider>, ConfigError> {
        Ok(Arc::new(Self::build(target, config)?))
    }

    fn build(target: &Target, config: &TargetConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTargetConfig {
            path: target.config_path(),
            reason,
        };
        let params: WinbindexParams = config.params_as().map_err(invalid)?;
        let repo_dir = match params.repo_dir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => target.dir.join(dir),
            None => target
                .dir
                .parent()
                .unwrap_or(&target.dir)
                .join(".winbindex"),
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("diffalayze/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| invalid(format!("http client: {e}")))?;

        Ok(Self {
            db_file: params
                .db_file
                .unwrap_or_else(|| format!("{}.json.gz", params.file_name)),
            file_name: params.file_name,
            windows_version: params.windows_version,
            repo_dir,
            repo_url: params.repo_url,
            branch: params.branch,
            verify_sha256: params.verify_sha256,
            git_timeout: Duration::from_secs(params.git_timeout_secs),
            download_dir: target.dir.clone(),
            version_log: target.version_log(),
            http,
        })
    }

    fn index_path(&self) -> PathBuf {
        self.repo_dir.join(INDEX_SUBDIR).join(&self.db_file)
    }

    fn git_spec(args: &[&str], timeout: Duration) -> ProcessSpec {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        ProcessSpec::new("git", argv)
            .with_output(OutputMode::Null, OutputMode::Capture)
            .with_timeout(Some(timeout))
    }

    fn clone_spec(&self) -> ProcessSpec {
        let dir = self.repo_dir.to_string_lossy().to_string();
        Self::git_spec(
            &[
                "clone",
                "--branch",
                &self.branch,
                "--single-branch",
                &self.repo_url,
                &dir,
            ],
            self.git_timeout,
        )
    }

    async fn git(&self, args: &[&str], timeout: Duration) -> Result<(), ProviderError> {
        self.run_git(&Self::git_spec(args, timeout)).await
    }

    async fn run_git(&self, spec: &ProcessSpec) -> Result<(), ProviderError> {
        // A cancelled run drops this future, and the child is killed on drop.
        let out = run_process(spec, &CancellationToken::new())
            .await
            .map_err(|e| ProviderError::Command(e.to_string()))?;
        if out.success() {
            Ok(())
        } else {
            Err(ProviderError::Command(format!(
                "git {} exited with {}: {}",
                spec.argv[1..].join(" "),
                out.exit_code,
                out.stderr.trim()
            )))
        }
    }

    async fn clone_repo(&self) -> Result<(), ProviderError> {
        self.run_git(&self.clone_spec()).await
    }

    async fn reclone(&self) -> Result<(), ProviderError> {
        if self.repo_dir.exists() {
            tokio::fs::remove_dir_all(&self.repo_dir).await?;
        }
        self.clone_repo().await
    }

    /// Clone the index if missing, otherwise update it; re-clone when the
    /// checkout is broken.
    async fn ensure_repo(&self) -> Result<(), ProviderError> {
        if !self.repo_dir.exists() {
            info!(repo = %self.repo_dir.display(), "cloning winbindex index (this may take some time)");
            return self.clone_repo().await;
        }
        if !self.repo_dir.join(".git").is_dir() {
            warn!(repo = %self.repo_dir.display(), "index directory is not a git repository, re-cloning");
            return self.reclone().await;
        }

        let dir = self.repo_dir.to_string_lossy().to_string();
        let update = async {
            self.git(&["-C", &dir, "checkout", &self.branch], CHECKOUT_TIMEOUT)
                .await?;
            self.git(&["-C", &dir, "pull", "origin", &self.branch], self.git_timeout)
                .await
        };
        if let Err(e) = update.await {
            warn!(error = %e, "index update failed, re-cloning");
            self.reclone().await?;
        }
        Ok(())
    }

    async fn download(&self, version: &IndexedVersion, dest: &Path) -> Result<(), ProviderError> {
        let url = version.url(&self.file_name);
        info!(url = %url, dest = %dest.display(), "downloading");
        let bytes = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        if self.verify_sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(&version.sha256) {
                return Err(ProviderError::Checksum {
                    url,
                    expected: version.sha256.clone(),
                    actual,
                });
            }
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl FetchProvider for WinbindexProvider {
    fn kind(&self) -> &str {
        KIND
    }

    async fn check_and_fetch(&self) -> Result<FetchOutcome, ProviderError> {
        self.ensure_repo().await?;

        let index_path = self.index_path();
        let index = tokio::task::spawn_blocking(move || load_index(&index_path))
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))??;

        let versions = select_versions(&index, &self.windows_version);
        let [newest, previous, ..] = versions.as_slice() else {
            return Err(ProviderError::VersionData(format!(
                "need two versions of {} for {}, found {}",
                self.file_name,
                self.windows_version,
                versions.len()
            )));
        };

        let newest_url = newest.url(&self.file_name);
        if read_version_log(&self.version_log)?.as_deref() == Some(newest_url.as_str()) {
            return Ok(FetchOutcome::NoUpdate);
        }

        let old_path = self.download_dir.join(format!("old.{}", self.file_name));
        let new_path = self.download_dir.join(format!("new.{}", self.file_name));
        self.download(previous, &old_path).await?;
        self.download(newest, &new_path).await?;

        write_version_log(&self.version_log, &newest_url)?;
        Ok(FetchOutcome::Pair(ArtifactPair::new(old_path, new_path)))
    }
}
