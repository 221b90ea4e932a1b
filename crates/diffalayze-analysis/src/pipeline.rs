//! The five-stage analysis pipeline.
//!
//! One run covers one archive: load the diff documents, analyze each one,
//! synthesize a report, evaluate it, then pass the evaluation through the
//! trigger gate. Any stage failure ends the run without writing a report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use diffalayze_core::{obs, ArchiveEntry};
use diffalayze_llm::{LlmError, ModelClient};

use crate::context::{AnalysisContext, ContextError, DocumentAnalysis, EvaluationRecord, LoadedDocument};
use crate::document::{html_to_text, is_document};
use crate::gate::{TriggerGate, TriggerOutcome};
use crate::prompts::PromptSet;
use crate::report::{render_report, write_report};
use crate::stage::Stage;

/// Joins per-document analyses into the synthesis input.
pub const ANALYSIS_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("documents directory not found: {0}")]
    MissingDocuments(PathBuf),

    #[error("no documents in {0}")]
    NoDocuments(PathBuf),

    #[error("cannot read document {path}: {source}")]
    ReadDocument {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} stage failed: {source}")]
    Model {
        stage: Stage,
        #[source]
        source: LlmError,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("cannot write report {path}: {source}")]
    WriteReport {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled before {stage} completed")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    fn model(stage: Stage, source: LlmError) -> Self {
        match source {
            LlmError::Cancelled => PipelineError::Cancelled { stage },
            source => PipelineError::Model { stage, source },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result of one successful run.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub target: String,
    pub report_path: PathBuf,
    pub documents: usize,
    pub evaluation: EvaluationRecord,
    pub trigger: TriggerOutcome,
}

pub struct AnalysisPipeline {
    client: ModelClient,
    prompts: Arc<PromptSet>,
    gate: TriggerGate,
}

impl AnalysisPipeline {
    pub fn new(client: ModelClient, prompts: Arc<PromptSet>, gate: TriggerGate) -> Self {
        Self {
            client,
            prompts,
            gate,
        }
    }

    pub fn gate(&self) -> &TriggerGate {
        &self.gate
    }

    /// Analyze an archive, writing the report next to it.
    pub async fn run(&self, entry: &ArchiveEntry, cancel: &CancellationToken) -> Result<AnalysisOutcome> {
        self.run_to(&entry.target, &entry.documents_dir(), &entry.report_path(), cancel)
            .await
    }

    /// Analyze the documents in `docs_dir` and write the report to `output`.
    pub async fn run_to(
        &self,
        target: &str,
        docs_dir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome> {
        let start = Instant::now();
        obs::emit_analysis_started(target, &docs_dir.display().to_string());
        let result = self
            .execute(target, docs_dir, output, cancel)
            .instrument(obs::target_span(target))
            .await;
        obs::emit_analysis_finished(target, result.is_ok(), start.elapsed().as_millis() as u64);
        result
    }

    async fn execute(
        &self,
        target: &str,
        docs_dir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome> {
        let mut ctx = AnalysisContext::new(target);

        for stage in Stage::ORDER {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { stage });
            }
            let started = Instant::now();
            match stage {
                Stage::Load => self.load(&mut ctx, docs_dir).await?,
                Stage::AnalyzeDocuments => self.analyze_documents(&mut ctx, cancel).await?,
                Stage::Synthesize => self.synthesize(&mut ctx, cancel).await?,
                Stage::Evaluate => self.evaluate(&mut ctx, cancel).await?,
                Stage::Trigger => {
                    let outcome = self.gate.evaluate(target, ctx.evaluation()?, cancel).await;
                    ctx.set_trigger(outcome)?;
                }
            }
            obs::emit_stage_completed(target, stage.name(), started.elapsed().as_millis() as u64);
        }

        let evaluation = ctx.evaluation()?.clone();
        let rendered = render_report(ctx.report()?, &evaluation);
        write_report(output, &rendered)
            .await
            .map_err(|source| PipelineError::WriteReport {
                path: output.to_path_buf(),
                source,
            })?;
        info!(report = %output.display(), level = evaluation.level_label(), "analysis report written");

        Ok(AnalysisOutcome {
            target: target.to_string(),
            report_path: output.to_path_buf(),
            documents: ctx.documents()?.len(),
            trigger: ctx
                .trigger()
                .cloned()
                .unwrap_or(TriggerOutcome::NotConfigured),
            evaluation,
        })
    }

    async fn load(&self, ctx: &mut AnalysisContext, docs_dir: &Path) -> Result<()> {
        if !docs_dir.is_dir() {
            return Err(PipelineError::MissingDocuments(docs_dir.to_path_buf()));
        }
        let read_err = |source: std::io::Error| PipelineError::ReadDocument {
            path: docs_dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(docs_dir).await.map_err(read_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let path = entry.path();
            if path.is_file() && is_document(&path) {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(PipelineError::NoDocuments(docs_dir.to_path_buf()));
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| PipelineError::ReadDocument {
                    path: path.clone(),
                    source,
                })?;
            let text = html_to_text(&String::from_utf8_lossy(&bytes));
            debug!(document = %path.display(), chars = text.len(), "document loaded");
            documents.push(LoadedDocument { path, text });
        }
        ctx.set_documents(documents)?;
        Ok(())
    }

    async fn analyze_documents(&self, ctx: &mut AnalysisContext, cancel: &CancellationToken) -> Result<()> {
        let documents = ctx.documents()?;
        let total = documents.len();
        let mut analyses = Vec::with_capacity(total);
        for (index, doc) in documents.iter().enumerate() {
            info!(document = %doc.path.display(), index = index + 1, total, "analyzing document");
            let messages = self.prompts.per_doc.messages(&doc.text);
            let analysis = self
                .client
                .call(&messages, cancel)
                .await
                .map_err(|e| PipelineError::model(Stage::AnalyzeDocuments, e))?;
            analyses.push(DocumentAnalysis {
                path: doc.path.clone(),
                analysis,
            });
        }
        ctx.set_analyses(analyses)?;
        Ok(())
    }

    async fn synthesize(&self, ctx: &mut AnalysisContext, cancel: &CancellationToken) -> Result<()> {
        let joined = ctx
            .analyses()?
            .iter()
            .map(|a| a.analysis.as_str())
            .collect::<Vec<_>>()
            .join(ANALYSIS_SEPARATOR);
        let messages = self.prompts.final_synthesis.messages(&joined);
        let report = self
            .client
            .call(&messages, cancel)
            .await
            .map_err(|e| PipelineError::model(Stage::Synthesize, e))?;
        ctx.set_report(report)?;
        Ok(())
    }

    async fn evaluate(&self, ctx: &mut AnalysisContext, cancel: &CancellationToken) -> Result<()> {
        let messages = self.prompts.evaluation.messages(ctx.report()?);
        let map = self
            .client
            .call_json(&messages, cancel)
            .await
            .map_err(|e| PipelineError::model(Stage::Evaluate, e))?;
        let evaluation = EvaluationRecord::from_map(&map);
        info!(
            level = evaluation.level_label(),
            score = %evaluation.score,
            "report evaluated"
        );
        ctx.set_evaluation(evaluation)?;
        Ok(())
    }
}

impl std::fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("client", &self.client)
            .field("gate", &self.gate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::PromptTemplate;
    use diffalayze_core::{Severity, DOCUMENTS_DIR};
    use diffalayze_llm::fakes::ScriptedBackend;
    use diffalayze_llm::{ChatMessage, Role};
    use tempfile::tempdir;

    fn prompts() -> Arc<PromptSet> {
        Arc::new(PromptSet {
            per_doc: PromptTemplate::new("PER", "Analyze this diff."),
            final_synthesis: PromptTemplate::new("SYN", "Merge these."),
            evaluation: PromptTemplate::new("EVAL", "Rate it."),
        })
    }

    fn user_body(messages: &[ChatMessage], instructions: &str) -> String {
        messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim_start_matches(instructions).trim_start().to_string())
            .unwrap_or_default()
    }

    /// Per-document calls echo the document text; synthesis echoes its input.
    fn echo_backend(evaluation: &'static str) -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend::new(move |_, messages| {
            Ok(match messages[0].content.as_str() {
                "PER" => format!("analysis<{}>", user_body(messages, "Analyze this diff.")),
                "SYN" => format!("REPORT[{}]", user_body(messages, "Merge these.")),
                _ => evaluation.to_string(),
            })
        }))
    }

    fn archive_with(docs: &[(&str, &str)]) -> (tempfile::TempDir, ArchiveEntry) {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ghidriffs_2025-06-01_120000");
        std::fs::create_dir_all(dir.join(DOCUMENTS_DIR)).unwrap();
        for (name, html) in docs {
            std::fs::write(dir.join(DOCUMENTS_DIR).join(name), html).unwrap();
        }
        (tmp, ArchiveEntry::new("afd", dir))
    }

    fn pipeline(backend: Arc<ScriptedBackend>) -> AnalysisPipeline {
        AnalysisPipeline::new(ModelClient::new(backend, 0.7), prompts(), TriggerGate::default())
    }

    #[tokio::test]
    async fn test_stage_order_and_separator() {
        let (_tmp, entry) = archive_with(&[
            ("b_func.html", "<p>second</p>"),
            ("a_func.html", "<p>first</p>"),
            ("notes.txt", "ignored"),
        ]);
        let backend = echo_backend(r#"{"level":"LOW","security_score":2,"summary":"minor"}"#);
        let outcome = pipeline(backend.clone())
            .run(&entry, &CancellationToken::new())
            .await
            .unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0][1].content.ends_with("first"));
        assert!(calls[1][1].content.ends_with("second"));
        assert_eq!(
            calls[2][1].content,
            format!("Merge these.\n\nanalysis<first>{ANALYSIS_SEPARATOR}analysis<second>")
        );
        assert!(calls[3][1].content.contains("REPORT[analysis<first>"));

        assert_eq!(outcome.documents, 2);
        assert_eq!(outcome.evaluation.level, Some(Severity::Low));
        assert_eq!(outcome.trigger, TriggerOutcome::NotConfigured);
        let report = std::fs::read_to_string(entry.report_path()).unwrap();
        assert!(report.starts_with("REPORT[analysis<first>"));
        assert!(report.contains("**Level:** LOW  \n**Score:** 2  \n**Summary:** minor"));
    }

    #[tokio::test]
    async fn test_document_failure_aborts_without_report() {
        let (_tmp, entry) = archive_with(&[("a.html", "<p>a</p>"), ("b.html", "<p>b</p>")]);
        let backend = Arc::new(ScriptedBackend::new(|index, _| {
            if index == 1 {
                Err(LlmError::Status {
                    status: 500,
                    body: "overloaded".to_string(),
                })
            } else {
                Ok("fine".to_string())
            }
        }));
        let err = pipeline(backend.clone())
            .run(&entry, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Model {
                stage: Stage::AnalyzeDocuments,
                ..
            }
        ));
        assert_eq!(backend.call_count(), 2);
        assert!(!entry.report_path().exists());
    }

    #[tokio::test]
    async fn test_undecodable_evaluation_is_fatal() {
        let (_tmp, entry) = archive_with(&[("a.html", "<p>a</p>")]);
        let err = pipeline(echo_backend("I think it is HIGH"))
            .run(&entry, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Model {
                stage: Stage::Evaluate,
                source: LlmError::Decode(_)
            }
        ));
        assert!(!entry.report_path().exists());
    }

    #[tokio::test]
    async fn test_missing_and_empty_documents() {
        let tmp = tempdir().unwrap();
        let entry = ArchiveEntry::new("afd", tmp.path().join("nope"));
        let backend = echo_backend("{}");
        let err = pipeline(backend.clone())
            .run(&entry, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingDocuments(_)));

        let (_tmp, empty) = archive_with(&[]);
        let err = pipeline(backend.clone())
            .run(&empty, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoDocuments(_)));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_tmp, entry) = archive_with(&[("a.html", "<p>a</p>")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let backend = echo_backend("{}");
        let err = pipeline(backend.clone()).run(&entry, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: Stage::Load }));
        assert!(err.is_cancelled());
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_to_custom_output() {
        let (tmp, entry) = archive_with(&[("a.html", "<h2>Diff</h2>")]);
        let output = tmp.path().join("reports").join("afd.md");
        let outcome = pipeline(echo_backend(r#"{"level":"NONE"}"#))
            .run_to("afd", &entry.documents_dir(), &output, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.report_path, output);
        assert!(output.is_file());
        assert!(!entry.report_path().exists());
    }
}
