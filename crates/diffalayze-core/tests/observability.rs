//! Structured lifecycle events.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use diffalayze_core::obs::{
    emit_analysis_finished, emit_stage_completed, emit_trigger_evaluated, target_span,
};
use diffalayze_core::{
    ArtifactPair, CommandEngine, DiffJobScheduler, EngineConfig, SchedulerConfig, Target,
};

#[traced_test]
#[test]
fn test_analysis_events_carry_event_field() {
    target_span("mrxsmb").in_scope(|| {
        emit_stage_completed("mrxsmb", "synthesize", 1200);
        emit_trigger_evaluated("mrxsmb", "HIGH", "HIGH", true);
        emit_analysis_finished("mrxsmb", true, 5000);
    });

    assert!(logs_contain("analysis.stage"));
    assert!(logs_contain("stage=synthesize"));
    assert!(logs_contain("trigger.evaluated"));
    assert!(logs_contain("fired=true"));
    assert!(logs_contain("analysis.finished"));
    assert!(logs_contain("diffalayze.target"));
}

#[tokio::test]
#[traced_test]
async fn test_failed_job_lifecycle_is_logged() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("ntfs");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("old.ntfs.sys"), b"a").unwrap();
    std::fs::write(dir.join("new.ntfs.sys"), b"b").unwrap();
    let target = Target::new("ntfs", &dir);
    let pair = ArtifactPair::new(dir.join("old.ntfs.sys"), dir.join("new.ntfs.sys"));

    let engine = Arc::new(CommandEngine::new(
        vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()],
        EngineConfig {
            timeout: Some(Duration::from_secs(10)),
            ..EngineConfig::default()
        },
    ));
    let mut scheduler = DiffJobScheduler::new(
        engine,
        SchedulerConfig::default(),
        CancellationToken::new(),
    );
    scheduler.submit(&target, pair).await;
    let report = scheduler.await_all(|_| {}).await;

    assert_eq!(report.failed(), 1);
    assert!(logs_contain("job.submitted"));
    assert!(logs_contain("job.started"));
    assert!(logs_contain("job.finished"));
    assert!(logs_contain("success=false"));
}
