//! Subprocess execution with deadlines and cancellation.
//!
//! Used for the diff engine, git housekeeping and the trigger action.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// How a child's output stream is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Capture into the returned [`ProcessOutput`].
    Capture,
    /// Pass through to the parent's stream.
    Inherit,
    /// Discard.
    Null,
}

impl OutputMode {
    fn stdio(self) -> Stdio {
        match self {
            OutputMode::Capture => Stdio::piped(),
            OutputMode::Inherit => Stdio::inherit(),
            OutputMode::Null => Stdio::null(),
        }
    }
}

/// Description of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Human-readable label used in errors.
    pub label: String,

    /// Command to execute (first element is the executable).
    pub argv: Vec<String>,

    /// Working directory, inherited when `None`.
    pub cwd: Option<PathBuf>,

    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,

    pub stdout: OutputMode,
    pub stderr: OutputMode,

    /// Wall-clock limit; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    /// Spec capturing both output streams, without stdin or deadline.
    pub fn new(label: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            label: label.into(),
            argv,
            cwd: None,
            stdin: None,
            stdout: OutputMode::Capture,
            stderr: OutputMode::Capture,
            timeout: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_output(mut self, stdout: OutputMode, stderr: OutputMode) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// Result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, `-1` when terminated by a signal.
    pub exit_code: i32,

    /// Captured stdout (empty unless captured).
    pub stdout: String,

    /// Captured stderr (empty unless captured).
    pub stderr: String,

    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors produced before a subprocess could report an exit status.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{label}: empty command")]
    EmptyCommand { label: String },

    #[error("{label}: failed to spawn {program}: {source}")]
    Spawn {
        label: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label}: io error: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label}: timed out after {limit_secs}s")]
    Timeout { label: String, limit_secs: u64 },

    #[error("{label}: cancelled")]
    Cancelled { label: String },
}

/// Run a subprocess to completion.
///
/// The child is killed when the deadline passes or `cancel` fires.
pub async fn run_process(
    spec: &ProcessSpec,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    let start = Instant::now();

    let Some((program, args)) = spec.argv.split_first() else {
        return Err(ProcessError::EmptyCommand {
            label: spec.label.clone(),
        });
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(spec.stdout.stdio())
        .stderr(spec.stderr.stdio())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        label: spec.label.clone(),
        program: program.clone(),
        source,
    })?;

    if let Some(input) = &spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading stdin closes the pipe; that
            // is its business, not a runner failure.
            if let Err(e) = stdin.write_all(input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ProcessError::Io {
                        label: spec.label.clone(),
                        source: e,
                    });
                }
            }
            drop(stdin);
        }
    }

    let wait = child.wait_with_output();
    let bounded = async {
        match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                ProcessError::Timeout {
                    label: spec.label.clone(),
                    limit_secs: limit.as_secs(),
                }
            }),
            None => Ok(wait.await),
        }
    };
    let waited = tokio::select! {
        result = bounded => result?,
        _ = cancel.cancelled() => {
            return Err(ProcessError::Cancelled { label: spec.label.clone() });
        }
    };
    let output = waited.map_err(|source| ProcessError::Io {
        label: spec.label.clone(),
        source,
    })?;

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
