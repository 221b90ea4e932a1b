//! Configuration-level error taxonomy.
//!
//! Run-wide configuration errors abort a run. Errors in one target's own
//! `target.toml` are reported through the same type but only skip that
//! target; everything else is isolated to one target, one job or one archive.

use std::path::PathBuf;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("targets root not found: {0}")]
    TargetsRootMissing(PathBuf),

    #[error("invalid target config {path}: {reason}")]
    InvalidTargetConfig { path: PathBuf, reason: String },

    #[error("unknown provider kind '{kind}' for target {target}")]
    UnknownProvider { target: String, kind: String },

    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::UnknownProvider {
            target: "mrxsmb".to_string(),
            kind: "ftp".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mrxsmb"));
        assert!(msg.contains("ftp"));

        let err = ConfigError::MissingEnv("OPENAI_API_KEY".to_string());
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
