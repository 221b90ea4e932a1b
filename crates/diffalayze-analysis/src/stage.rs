//! The fixed stages of an analysis run.

use serde::Serialize;
use std::fmt;

/// Analysis stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Convert the archive's documents to text.
    Load,
    /// One model call per document.
    AnalyzeDocuments,
    /// Merge the per-document analyses into one report.
    Synthesize,
    /// Structured severity rating of the report.
    Evaluate,
    /// Threshold gate and external action.
    Trigger,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Load,
        Stage::AnalyzeDocuments,
        Stage::Synthesize,
        Stage::Evaluate,
        Stage::Trigger,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::AnalyzeDocuments => "analyze_documents",
            Stage::Synthesize => "synthesize",
            Stage::Evaluate => "evaluate",
            Stage::Trigger => "trigger",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
