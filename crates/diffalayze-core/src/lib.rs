//! diffalayze core library
//!
//! Target discovery, fetch providers, diff engines and the bounded diff job
//! scheduler, plus the pieces shared with the analysis layer: the severity
//! scale, the defensive JSON decoder, subprocess execution and tracing.

pub mod archive;
pub mod decode;
pub mod engine;
pub mod error;
pub mod obs;
pub mod process;
pub mod provider;
pub mod scheduler;
pub mod severity;
pub mod target;
pub mod telemetry;

pub use archive::{ArchiveEntry, ArchiveError, DOCUMENTS_DIR};
pub use decode::{decode_object, DecodeError, MAX_UNWRAP_ATTEMPTS};
pub use engine::{
    CommandEngine, DiffEngine, DiffRequest, EngineConfig, EngineError, GhidriffEngine,
    DEFAULT_GHIDRIFF_IMAGE,
};
pub use error::ConfigError;
pub use process::{run_process, OutputMode, ProcessError, ProcessOutput, ProcessSpec};
pub use provider::{
    ArtifactPair, FetchOutcome, FetchProvider, LocalProvider, ProviderError, ProviderRegistry,
    WinbindexProvider,
};
pub use scheduler::{
    DiffJobScheduler, JobId, JobRecord, JobState, Progress, SchedulerConfig, SchedulerReport,
};
pub use severity::{level_ge, Severity};
pub use target::{
    discover_targets, resolve_target, select_targets, Target, TargetConfig, TargetError,
    TargetSelector,
};
pub use telemetry::init_tracing;

/// Crate version, for `--version` output and user agents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
