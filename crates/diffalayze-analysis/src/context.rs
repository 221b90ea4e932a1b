//! Shared state threaded through one analysis run.
//!
//! Each field is populated by exactly one stage and read only by later
//! stages. Setters refuse a second write and getters refuse to read a field
//! that has not been populated yet, so stage ordering is a data dependency.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

use diffalayze_core::Severity;

use crate::gate::TriggerOutcome;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context field '{0}' was already set")]
    AlreadySet(&'static str),

    #[error("context field '{0}' read before it was set")]
    Unset(&'static str),
}

/// One converted diff document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedDocument {
    pub path: PathBuf,
    pub text: String,
}

/// Model analysis of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentAnalysis {
    pub path: PathBuf,
    pub analysis: String,
}

/// Score as returned by the evaluation stage: a number, free text, or
/// absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Score {
    Number(serde_json::Number),
    Text(String),
    Missing,
}

impl Score {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) => Score::Number(n.clone()),
            Some(Value::String(s)) if !s.trim().is_empty() => Score::Text(s.trim().to_string()),
            Some(Value::Null) | None => Score::Missing,
            Some(Value::String(_)) => Score::Missing,
            Some(other) => Score::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Number(n) => write!(f, "{n}"),
            Score::Text(s) => f.write_str(s),
            Score::Missing => f.write_str("N/A"),
        }
    }
}

/// Structured result of the evaluation stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRecord {
    /// Recognised severity, `None` when absent or not on the scale.
    pub level: Option<Severity>,
    /// Level exactly as the model returned it.
    pub raw_level: Option<String>,
    pub score: Score,
    pub summary: String,
}

impl EvaluationRecord {
    /// Build from the decoded evaluation object (`level`, `security_score`,
    /// `summary`).
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let raw_level = map.get("level").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        });
        Self {
            level: raw_level.as_deref().and_then(Severity::parse),
            raw_level,
            score: Score::from_value(map.get("security_score")),
            summary: map
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Upper-case level name, `UNKNOWN` when unrecognised.
    pub fn level_label(&self) -> &'static str {
        self.level.map(|l| l.as_str()).unwrap_or("UNKNOWN")
    }

    /// Level as shown in the report: the scale name when recognised, else
    /// the model's own text, else `UNKNOWN`.
    pub fn display_level(&self) -> &str {
        match (self.level, self.raw_level.as_deref().map(str::trim)) {
            (Some(level), _) => level.as_str(),
            (None, Some(raw)) if !raw.is_empty() => raw,
            (None, _) => "UNKNOWN",
        }
    }
}

/// State of one analysis run over one archive.
#[derive(Debug, Default)]
pub struct AnalysisContext {
    target: String,
    documents: Option<Vec<LoadedDocument>>,
    analyses: Option<Vec<DocumentAnalysis>>,
    report: Option<String>,
    evaluation: Option<EvaluationRecord>,
    trigger: Option<TriggerOutcome>,
}

fn set_once<T>(slot: &mut Option<T>, field: &'static str, value: T) -> Result<(), ContextError> {
    if slot.is_some() {
        return Err(ContextError::AlreadySet(field));
    }
    *slot = Some(value);
    Ok(())
}

fn get<'a, T>(slot: &'a Option<T>, field: &'static str) -> Result<&'a T, ContextError> {
    slot.as_ref().ok_or(ContextError::Unset(field))
}

impl AnalysisContext {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_documents(&mut self, documents: Vec<LoadedDocument>) -> Result<(), ContextError> {
        set_once(&mut self.documents, "documents", documents)
    }

    pub fn documents(&self) -> Result<&[LoadedDocument], ContextError> {
        get(&self.documents, "documents").map(Vec::as_slice)
    }

    pub fn set_analyses(&mut self, analyses: Vec<DocumentAnalysis>) -> Result<(), ContextError> {
        set_once(&mut self.analyses, "analyses", analyses)
    }

    pub fn analyses(&self) -> Result<&[DocumentAnalysis], ContextError> {
        get(&self.analyses, "analyses").map(Vec::as_slice)
    }

    pub fn set_report(&mut self, report: String) -> Result<(), ContextError> {
        set_once(&mut self.report, "report", report)
    }

    pub fn report(&self) -> Result<&str, ContextError> {
        get(&self.report, "report").map(String::as_str)
    }

    pub fn set_evaluation(&mut self, evaluation: EvaluationRecord) -> Result<(), ContextError> {
        set_once(&mut self.evaluation, "evaluation", evaluation)
    }

    pub fn evaluation(&self) -> Result<&EvaluationRecord, ContextError> {
        get(&self.evaluation, "evaluation")
    }

    pub fn set_trigger(&mut self, outcome: TriggerOutcome) -> Result<(), ContextError> {
        set_once(&mut self.trigger, "trigger", outcome)
    }

    /// Trigger outcome, `None` until the trigger stage ran.
    pub fn trigger(&self) -> Option<&TriggerOutcome> {
        self.trigger.as_ref()
    }
}
