//! Diff engine adapters.
//!
//! An engine is handed a working directory holding the two artifacts and
//! must leave a `sxs_html/` documents directory behind on success.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::archive::DOCUMENTS_DIR;
use crate::process::{run_process, OutputMode, ProcessError, ProcessSpec};

pub const DEFAULT_GHIDRIFF_IMAGE: &str = "ghcr.io/clearbluejar/ghidriff:latest";
const GHIDRIFF_PYTHONPATH: &str = "PYTHONPATH=/home/vscode/.local/lib/python3.12/site-packages";

/// One engine invocation.
#[derive(Debug, Clone, Copy)]
pub struct DiffRequest<'a> {
    pub target: &'a str,
    pub work_dir: &'a Path,
    /// File name of the old artifact inside `work_dir`.
    pub old_name: &'a str,
    /// File name of the new artifact inside `work_dir`.
    pub new_name: &'a str,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("diff engine exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("diff engine produced no documents directory at {0}")]
    MissingOutput(PathBuf),
}

/// External diffing engine.
#[async_trait]
pub trait DiffEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn diff(
        &self,
        request: &DiffRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;
}

/// Require the documents directory an engine run must produce.
pub fn verify_output(work_dir: &Path) -> Result<PathBuf, EngineError> {
    let docs = work_dir.join(DOCUMENTS_DIR);
    if docs.is_dir() {
        Ok(docs)
    } else {
        Err(EngineError::MissingOutput(docs))
    }
}

fn check_exit(code: i32, stderr: String) -> Result<(), EngineError> {
    if code == 0 {
        Ok(())
    } else {
        Err(EngineError::NonZeroExit {
            code,
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Settings shared by the built-in engines.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Container image for ghidriff.
    pub image: String,
    /// Per-invocation deadline.
    pub timeout: Option<Duration>,
    /// Pass engine output through to the terminal.
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_GHIDRIFF_IMAGE.to_string(),
            timeout: Some(Duration::from_secs(4 * 60 * 60)),
            verbose: false,
        }
    }
}

impl EngineConfig {
    fn output_modes(&self) -> (OutputMode, OutputMode) {
        if self.verbose {
            (OutputMode::Inherit, OutputMode::Inherit)
        } else {
            (OutputMode::Null, OutputMode::Capture)
        }
    }
}

/// ghidriff running in docker, with the working directory mounted at
/// `/ghidriffs`.
#[derive(Debug, Clone, Default)]
pub struct GhidriffEngine {
    config: EngineConfig,
}

impl GhidriffEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Full `docker run` command line for one request.
    pub fn command(&self, request: &DiffRequest<'_>, owner: Option<(u32, u32)>) -> Vec<String> {
        let mut argv: Vec<String> = vec!["docker".into(), "run".into(), "--rm".into()];
        if let Some((uid, gid)) = owner {
            argv.push("-u".into());
            argv.push(format!("{uid}:{gid}"));
        }
        argv.extend([
            "-e".to_string(),
            "HOME=/tmp".to_string(),
            "-e".to_string(),
            GHIDRIFF_PYTHONPATH.to_string(),
            "-v".to_string(),
            format!("{}:/ghidriffs", request.work_dir.display()),
            self.config.image.clone(),
            "--force-diff".to_string(),
            "--sxs".to_string(),
            format!("ghidriffs/{}", request.old_name),
            format!("ghidriffs/{}", request.new_name),
        ]);
        argv
    }
}

/// Owner of the working directory, so the container writes files we can move.
#[cfg(unix)]
fn dir_owner(dir: &Path) -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(dir).ok().map(|m| (m.uid(), m.gid()))
}

#[cfg(not(unix))]
fn dir_owner(_dir: &Path) -> Option<(u32, u32)> {
    None
}

#[async_trait]
impl DiffEngine for GhidriffEngine {
    fn name(&self) -> &str {
        "ghidriff"
    }

    async fn diff(
        &self,
        request: &DiffRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        // docker rejects relative bind mounts.
        let work_dir = if request.work_dir.is_absolute() {
            request.work_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| ProcessError::Io {
                    label: "ghidriff".to_string(),
                    source,
                })?
                .join(request.work_dir)
        };
        let absolute = DiffRequest {
            work_dir: &work_dir,
            ..*request
        };
        let argv = self.command(&absolute, dir_owner(&work_dir));
        debug!(target_name = %request.target, argv = ?argv, "starting ghidriff");

        let (stdout, stderr) = self.config.output_modes();
        let spec = ProcessSpec::new(format!("ghidriff ({})", request.target), argv)
            .with_output(stdout, stderr)
            .with_timeout(self.config.timeout);
        let out = run_process(&spec, cancel).await?;
        check_exit(out.exit_code, out.stderr)
    }
}

/// Arbitrary command run inside the working directory.
///
/// `{work_dir}`, `{old}` and `{new}` in any argument are replaced with the
/// working directory and the two artifact file names.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    argv: Vec<String>,
    config: EngineConfig,
}

impl CommandEngine {
    pub fn new(argv: Vec<String>, config: EngineConfig) -> Self {
        Self { argv, config }
    }

    pub fn command(&self, request: &DiffRequest<'_>) -> Vec<String> {
        let work_dir = request.work_dir.display().to_string();
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{work_dir}", &work_dir)
                    .replace("{old}", request.old_name)
                    .replace("{new}", request.new_name)
            })
            .collect()
    }
}

#[async_trait]
impl DiffEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    async fn diff(
        &self,
        request: &DiffRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let (stdout, stderr) = self.config.output_modes();
        let spec = ProcessSpec::new(format!("engine ({})", request.target), self.command(request))
            .with_cwd(request.work_dir)
            .with_output(stdout, stderr)
            .with_timeout(self.config.timeout);
        let out = run_process(&spec, cancel).await?;
        check_exit(out.exit_code, out.stderr)
    }
}
