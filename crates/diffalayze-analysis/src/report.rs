//! Persisted analysis report.

use std::path::Path;

use crate::context::EvaluationRecord;

pub const EVALUATION_HEADING: &str = "## Security Relevance Evaluation";

/// Synthesized report followed by the evaluation section.
pub fn render_report(report: &str, evaluation: &EvaluationRecord) -> String {
    format!(
        "{report}\n\n---\n\n{EVALUATION_HEADING}\n**Level:** {}  \n**Score:** {}  \n**Summary:** {}\n\n",
        evaluation.display_level(),
        evaluation.score,
        evaluation.summary,
    )
}

/// Write the rendered report, creating parent directories.
pub async fn write_report(path: &Path, rendered: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, rendered).await
}
