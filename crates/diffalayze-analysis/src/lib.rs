//! diffalayze analysis
//!
//! Turns archived side-by-side diffs into a security report:
//! - Converts the HTML diff documents to text
//! - Runs the five-stage model pipeline (load, per-document analysis,
//!   synthesis, evaluation, trigger)
//! - Gates an external action on the evaluated severity
//! - Orchestrates whole runs from fetch to report

pub mod context;
pub mod document;
pub mod gate;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod report;
pub mod stage;

pub use context::{AnalysisContext, ContextError, EvaluationRecord, Score};
pub use document::html_to_text;
pub use gate::{split_command, GateError, TriggerAction, TriggerGate, TriggerOutcome, TriggerResult};
pub use orchestrator::{Orchestrator, RunConfig, RunReport};
pub use pipeline::{AnalysisOutcome, AnalysisPipeline, PipelineError, ANALYSIS_SEPARATOR};
pub use prompts::{PromptError, PromptSet, PromptTemplate};
pub use report::render_report;
pub use stage::Stage;
