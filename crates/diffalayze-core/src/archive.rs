//! Archive hand-off between finished diff jobs and analysis.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Subdirectory of an archive holding the side-by-side comparison documents.
pub const DOCUMENTS_DIR: &str = "sxs_html";
/// Archive directory name prefix.
pub const ARCHIVE_PREFIX: &str = "ghidriffs_";
/// Timestamp layout used in archive directory names.
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// A persisted diff output, consumed once by the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub target: String,
    pub dir: PathBuf,
}

impl ArchiveEntry {
    pub fn new(target: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            dir: dir.into(),
        }
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.dir.join(DOCUMENTS_DIR)
    }

    /// Default location of the analysis report.
    pub fn report_path(&self) -> PathBuf {
        self.dir.join("analysis.md")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Current local time formatted for archive names.
pub fn archive_stamp() -> String {
    chrono::Local::now().format(ARCHIVE_TIMESTAMP_FORMAT).to_string()
}

/// First free archive path for `stamp` under `archive_root`.
///
/// Two archives created within the same second get `_1`, `_2`, ... suffixes.
/// Callers serialise allocation and the following move.
pub fn next_archive_dir(archive_root: &Path, stamp: &str) -> PathBuf {
    let base = archive_root.join(format!("{ARCHIVE_PREFIX}{stamp}"));
    if !base.exists() {
        return base;
    }
    (1u32..)
        .map(|n| archive_root.join(format!("{ARCHIVE_PREFIX}{stamp}_{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(base)
}

/// Move a finished working directory into the archive root.
pub fn archive_work_dir(
    work_dir: &Path,
    archive_root: &Path,
    stamp: &str,
) -> Result<PathBuf, ArchiveError> {
    std::fs::create_dir_all(archive_root)?;
    let dest = next_archive_dir(archive_root, stamp);
    move_path(work_dir, &dest)?;
    Ok(dest)
}

/// Rename `from` to `to`, copying files across filesystems when needed.
pub fn move_path(from: &Path, to: &Path) -> Result<(), ArchiveError> {
    let wrap = |source: std::io::Error| ArchiveError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) if from.is_file() => {
            std::fs::copy(from, to).map_err(wrap)?;
            std::fs::remove_file(from).map_err(wrap)?;
            tracing::debug!(error = %rename_err, "rename failed, copied instead");
            Ok(())
        }
        Err(e) => Err(wrap(e)),
    }
}
