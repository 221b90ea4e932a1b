//! Severity-threshold gate in front of an external action.

use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use diffalayze_core::obs;
use diffalayze_core::severity::optional_level_reaches;
use diffalayze_core::{run_process, ProcessSpec, Severity};

use crate::context::EvaluationRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("trigger command is empty")]
    EmptyCommand,

    #[error("unbalanced quote in trigger command: {0}")]
    UnbalancedQuote(String),
}

/// Split a command line into arguments.
///
/// Whitespace separates arguments; single quotes keep everything literal;
/// double quotes group and honour `\"` and `\\`; a backslash outside quotes
/// escapes the next character. No shell is involved.
pub fn split_command(cmd: &str) -> Result<Vec<String>, GateError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(GateError::UnbalancedQuote(cmd.to_string())),
                    }
                }
            }
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(GateError::UnbalancedQuote(cmd.to_string())),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(GateError::UnbalancedQuote(cmd.to_string())),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    if args.is_empty() {
        return Err(GateError::EmptyCommand);
    }
    Ok(args)
}

/// External action run when the threshold is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerAction {
    pub argv: Vec<String>,
    pub timeout: Option<Duration>,
}

impl TriggerAction {
    pub fn parse(cmd: &str, timeout: Option<Duration>) -> Result<Self, GateError> {
        Ok(Self {
            argv: split_command(cmd)?,
            timeout,
        })
    }
}

/// Exit status and output of the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// What the gate did for one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// No action configured.
    NotConfigured,
    /// Level unknown or under the threshold.
    BelowThreshold {
        level: Option<Severity>,
        threshold: Severity,
    },
    /// The action ran; its exit code is informational.
    Fired(TriggerResult),
    /// The action could not be run to completion.
    ActionFailed { error: String },
}

impl TriggerOutcome {
    /// Whether the action was attempted.
    pub fn fired(&self) -> bool {
        matches!(self, TriggerOutcome::Fired(_) | TriggerOutcome::ActionFailed { .. })
    }
}

/// Line written to the action's stdin: `<target> <score> <LEVEL>\n`.
pub fn payload(target: &str, evaluation: &EvaluationRecord) -> String {
    format!(
        "{} {} {}\n",
        target,
        evaluation.score,
        evaluation.level_label()
    )
}

#[derive(Debug, Clone)]
pub struct TriggerGate {
    pub action: Option<TriggerAction>,
    pub threshold: Severity,
}

impl Default for TriggerGate {
    fn default() -> Self {
        Self {
            action: None,
            threshold: Severity::High,
        }
    }
}

impl TriggerGate {
    pub fn new(action: Option<TriggerAction>, threshold: Severity) -> Self {
        Self { action, threshold }
    }

    /// Whether `evaluation` would fire a configured action.
    pub fn reaches(&self, evaluation: &EvaluationRecord) -> bool {
        optional_level_reaches(evaluation.level, self.threshold)
    }

    /// Decide and, when the threshold is reached, run the action.
    ///
    /// Action failures are reported in the outcome, never as errors.
    pub async fn evaluate(
        &self,
        target: &str,
        evaluation: &EvaluationRecord,
        cancel: &CancellationToken,
    ) -> TriggerOutcome {
        let outcome = match &self.action {
            None => TriggerOutcome::NotConfigured,
            Some(_) if !self.reaches(evaluation) => TriggerOutcome::BelowThreshold {
                level: evaluation.level,
                threshold: self.threshold,
            },
            Some(action) => self.run_action(action, target, evaluation, cancel).await,
        };
        obs::emit_trigger_evaluated(
            target,
            evaluation.level_label(),
            self.threshold.as_str(),
            outcome.fired(),
        );
        outcome
    }

    async fn run_action(
        &self,
        action: &TriggerAction,
        target: &str,
        evaluation: &EvaluationRecord,
        cancel: &CancellationToken,
    ) -> TriggerOutcome {
        let spec = ProcessSpec::new("trigger", action.argv.clone())
            .with_stdin(payload(target, evaluation))
            .with_timeout(action.timeout);
        match run_process(&spec, cancel).await {
            Ok(output) => {
                if output.success() {
                    info!(exit_code = output.exit_code, "trigger action completed");
                } else {
                    warn!(
                        exit_code = output.exit_code,
                        stderr = %output.stderr.trim(),
                        "trigger action exited non-zero"
                    );
                }
                TriggerOutcome::Fired(TriggerResult {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Err(e) => {
                warn!(error = %e, "trigger action failed");
                TriggerOutcome::ActionFailed {
                    error: e.to_string(),
                }
            }
        }
    }
}
