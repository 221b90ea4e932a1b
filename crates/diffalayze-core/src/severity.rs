//! Ordered severity scale used for evaluation levels and trigger thresholds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity levels, totally ordered `NONE < LOW < MEDIUM < HIGH < CRITICAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Every level, lowest first.
    pub const ALL: [Severity; 5] = [
        Severity::None,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Canonical upper-case token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Parse a token case-insensitively. Unrecognised tokens yield `None`.
    pub fn parse(token: &str) -> Option<Severity> {
        let token = token.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(token))
    }

    /// Whether this level is at or above `threshold`.
    pub fn reaches(self, threshold: Severity) -> bool {
        self >= threshold
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a severity token is not on the scale.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity level: {0}")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse(s).ok_or_else(|| UnknownSeverity(s.to_string()))
    }
}

/// Compare two raw level tokens on the scale.
///
/// Returns `false` whenever either token is unrecognised, so a malformed
/// level can never satisfy a threshold.
pub fn level_ge(a: &str, b: &str) -> bool {
    match (Severity::parse(a), Severity::parse(b)) {
        (Some(a), Some(b)) => a.reaches(b),
        _ => false,
    }
}

/// Threshold check for an optional, already-parsed level.
pub fn optional_level_reaches(level: Option<Severity>, threshold: Severity) -> bool {
    level.is_some_and(|l| l.reaches(threshold))
}
