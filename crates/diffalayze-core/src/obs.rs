//! Structured lifecycle events for diff jobs and analysis runs.
//!
//! Every event carries an `event` field so log pipelines can filter on it,
//! e.g. `event=job.finished target=mrxsmb success=false`.

use tracing::{info, warn};

/// Span tagging everything logged inside it with the target name. Attach it
/// with `.instrument` so it follows the work across awaits.
pub fn target_span(target: &str) -> tracing::Span {
    tracing::info_span!("diffalayze.target", target = %target)
}

pub fn emit_job_submitted(job_id: &str, target: &str) {
    info!(event = "job.submitted", job_id = %job_id, target = %target);
}

pub fn emit_job_started(job_id: &str, target: &str) {
    info!(event = "job.started", job_id = %job_id, target = %target);
}

/// Emit event: a diff job reached a terminal state.
pub fn emit_job_finished(job_id: &str, target: &str, success: bool, duration_ms: u64) {
    if success {
        info!(
            event = "job.finished",
            job_id = %job_id,
            target = %target,
            success = success,
            duration_ms = duration_ms,
        );
    } else {
        warn!(
            event = "job.finished",
            job_id = %job_id,
            target = %target,
            success = success,
            duration_ms = duration_ms,
        );
    }
}

/// Emit event: scheduler progress tick.
pub fn emit_progress(total: usize, remaining: usize) {
    info!(event = "scheduler.progress", total = total, remaining = remaining);
}

pub fn emit_analysis_started(target: &str, archive: &str) {
    info!(event = "analysis.started", target = %target, archive = %archive);
}

/// Emit event: one pipeline stage completed.
pub fn emit_stage_completed(target: &str, stage: &str, duration_ms: u64) {
    info!(event = "analysis.stage", target = %target, stage = %stage, duration_ms = duration_ms);
}

/// Emit event: an analysis run ended, with or without a report.
pub fn emit_analysis_finished(target: &str, success: bool, duration_ms: u64) {
    info!(
        event = "analysis.finished",
        target = %target,
        success = success,
        duration_ms = duration_ms,
    );
}

/// Emit event: trigger gate decision.
pub fn emit_trigger_evaluated(target: &str, level: &str, threshold: &str, fired: bool) {
    info!(
        event = "trigger.evaluated",
        target = %target,
        level = %level,
        threshold = %threshold,
        fired = fired,
    );
}
