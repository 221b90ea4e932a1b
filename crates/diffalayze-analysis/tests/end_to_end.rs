//! Whole runs against fake providers, a shell diff engine and a scripted
//! model backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use diffalayze_analysis::{
    AnalysisPipeline, Orchestrator, PromptSet, PromptTemplate, RunConfig, RunReport, TriggerAction,
    TriggerGate,
};
use diffalayze_core::{
    ArtifactPair, CommandEngine, DiffEngine, EngineConfig, FetchOutcome, FetchProvider,
    ProviderError, ProviderRegistry, SchedulerConfig, Severity, TargetSelector, DOCUMENTS_DIR,
};
use diffalayze_llm::fakes::ScriptedBackend;
use diffalayze_llm::ModelClient;
use tempfile::TempDir;

struct NoUpdate;

#[async_trait]
impl FetchProvider for NoUpdate {
    fn kind(&self) -> &str {
        "no-update"
    }

    async fn check_and_fetch(&self) -> Result<FetchOutcome, ProviderError> {
        Ok(FetchOutcome::NoUpdate)
    }
}

/// Stages a fresh `old.<file>` / `new.<file>` pair in the target directory.
struct FreshPair {
    dir: PathBuf,
    file: String,
}

#[async_trait]
impl FetchProvider for FreshPair {
    fn kind(&self) -> &str {
        "fresh-pair"
    }

    async fn check_and_fetch(&self) -> Result<FetchOutcome, ProviderError> {
        let old = self.dir.join(format!("old.{}", self.file));
        let new = self.dir.join(format!("new.{}", self.file));
        std::fs::write(&old, b"MZ old")?;
        std::fs::write(&new, b"MZ new")?;
        Ok(FetchOutcome::Pair(ArtifactPair::new(old, new)))
    }
}

struct Broken;

#[async_trait]
impl FetchProvider for Broken {
    fn kind(&self) -> &str {
        "broken"
    }

    async fn check_and_fetch(&self) -> Result<FetchOutcome, ProviderError> {
        Err(ProviderError::Network("connection refused".to_string()))
    }
}

struct Fixture {
    root: TempDir,
    registry: ProviderRegistry,
}

impl Fixture {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            registry: ProviderRegistry::new(),
        }
    }

    fn target_dir(&self, name: &str) -> PathBuf {
        let dir = self.root.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn with_provider(mut self, name: &str, provider: Arc<dyn FetchProvider>) -> Self {
        self.target_dir(name);
        self.registry.bind(name, provider);
        self
    }

    fn with_pair(self, name: &str) -> Self {
        let provider = Arc::new(FreshPair {
            dir: self.target_dir(name),
            file: format!("{name}.sys"),
        });
        self.with_provider(name, provider)
    }

    fn config(&self, analyze: bool) -> RunConfig {
        RunConfig {
            analyze,
            scheduler: SchedulerConfig {
                max_concurrent: 2,
                progress_interval: Duration::from_millis(50),
            },
            ..RunConfig::new(self.root.path(), TargetSelector::All)
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }
}

/// Writes one side-by-side document; fails for artifacts named `bad*`.
fn shell_engine() -> Arc<dyn DiffEngine> {
    let script = format!(
        "case '{{old}}' in old.bad*) echo 'ghidra crashed' >&2; exit 3;; esac; \
         mkdir -p {DOCUMENTS_DIR} && \
         printf '<h1>{{old}} vs {{new}}</h1><table><tr><td>mov</td><td>xor</td></tr></table>' \
         > {DOCUMENTS_DIR}/func_a.html"
    );
    Arc::new(CommandEngine::new(
        vec!["sh".to_string(), "-c".to_string(), script],
        EngineConfig {
            timeout: Some(Duration::from_secs(30)),
            ..EngineConfig::default()
        },
    ))
}

fn prompts() -> Arc<PromptSet> {
    Arc::new(PromptSet {
        per_doc: PromptTemplate::new("PER", "Analyze."),
        final_synthesis: PromptTemplate::new("SYN", "Synthesize."),
        evaluation: PromptTemplate::new("EVAL", "Evaluate."),
    })
}

fn backend(level: &'static str, score: u32) -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new(move |_, messages| {
        Ok(match messages[0].content.as_str() {
            "PER" => "<think>hmm</think>The function gained a length check.".to_string(),
            "SYN" => "# Patch report\nA length check was added.".to_string(),
            _ => format!(
                "{{\"level\": \"{level}\", \"security_score\": {score}, \"summary\": \"Bounds check\"}}"
            ),
        })
    }))
}

fn pipeline(backend: Arc<ScriptedBackend>, trigger_log: Option<&Path>) -> AnalysisPipeline {
    let action = trigger_log.map(|log| {
        TriggerAction::parse(
            &format!("sh -c 'cat >> \"{}\"'", log.display()),
            Some(Duration::from_secs(10)),
        )
        .unwrap()
    });
    AnalysisPipeline::new(
        ModelClient::new(backend, 0.7),
        prompts(),
        TriggerGate::new(action, Severity::High),
    )
}

async fn run(orchestrator: &Orchestrator) -> RunReport {
    orchestrator
        .run(&CancellationToken::new(), |_| {})
        .await
        .unwrap()
}

#[tokio::test]
async fn test_no_update_submits_nothing() {
    let fx = Fixture::new().with_provider("afd", Arc::new(NoUpdate));
    let backend = backend("HIGH", 9);
    let orchestrator = Orchestrator::new(fx.config(true), fx.registry.clone(), shell_engine())
        .with_analysis(pipeline(backend.clone(), None));

    let report = run(&orchestrator).await;

    assert_eq!(report.targets_checked, 1);
    assert_eq!(report.no_update, 1);
    assert_eq!(report.jobs_succeeded + report.jobs_failed, 0);
    assert!(report.archives.is_empty());
    assert!(!fx.path("afd/archive").exists());
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_new_pair_is_diffed_archived_and_analyzed() {
    let fx = Fixture::new().with_pair("mrxsmb");
    let backend = backend("LOW", 3);
    let orchestrator = Orchestrator::new(fx.config(true), fx.registry.clone(), shell_engine())
        .with_analysis(pipeline(backend.clone(), None));

    let report = run(&orchestrator).await;

    assert_eq!(report.jobs_succeeded, 1);
    assert_eq!(report.archives.len(), 1);
    assert_eq!(report.analyses_completed, 1);
    assert_eq!(report.triggers_fired, 0);

    let entry = &report.archives[0];
    assert_eq!(entry.target, "mrxsmb");
    assert!(entry.dir.starts_with(fx.path("mrxsmb/archive")));
    assert!(entry.documents_dir().join("func_a.html").is_file());
    assert!(entry.dir.join("old.mrxsmb.sys").is_file());

    // Per-document, synthesis and evaluation calls.
    let calls = backend.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[0][1].content.contains("# old.mrxsmb.sys vs new.mrxsmb.sys"));
    assert!(calls[0][1].content.contains("mov | xor"));
    assert_eq!(
        calls[1][1].content,
        "Synthesize.\n\nThe function gained a length check."
    );

    let text = std::fs::read_to_string(entry.report_path()).unwrap();
    assert!(text.starts_with("# Patch report\nA length check was added."));
    assert!(text.contains("## Security Relevance Evaluation\n**Level:** LOW  \n**Score:** 3  \n"));
    assert_eq!(report.reports, vec![entry.report_path()]);
}

#[tokio::test]
async fn test_engine_failure_is_isolated() {
    let fx = Fixture::new().with_pair("bad").with_pair("good");
    let backend = backend("LOW", 1);
    let orchestrator = Orchestrator::new(fx.config(true), fx.registry.clone(), shell_engine())
        .with_analysis(pipeline(backend.clone(), None));

    let report = run(&orchestrator).await;

    assert_eq!(report.targets_checked, 2);
    assert_eq!(report.jobs_failed, 1);
    assert_eq!(report.jobs_succeeded, 1);
    assert_eq!(report.archives.len(), 1);
    assert_eq!(report.archives[0].target, "good");
    assert_eq!(report.analyses_completed, 1);

    assert!(!fx.path("bad/archive").exists());
    // The failed working directory is left for inspection.
    let leftovers: Vec<_> = std::fs::read_dir(fx.path("bad/work")).unwrap().collect();
    assert_eq!(leftovers.len(), 1);
}

#[tokio::test]
async fn test_high_evaluation_fires_trigger_once() {
    let fx = Fixture::new().with_pair("mrxsmb");
    let log = fx.path("trigger.log");
    let orchestrator = Orchestrator::new(fx.config(true), fx.registry.clone(), shell_engine())
        .with_analysis(pipeline(backend("HIGH", 9), Some(&log)));

    let report = run(&orchestrator).await;

    assert_eq!(report.analyses_completed, 1);
    assert_eq!(report.triggers_fired, 1);
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "mrxsmb 9 HIGH\n");
}

#[tokio::test]
async fn test_medium_evaluation_below_high_threshold() {
    let fx = Fixture::new().with_pair("mrxsmb");
    let log = fx.path("trigger.log");
    let orchestrator = Orchestrator::new(fx.config(true), fx.registry.clone(), shell_engine())
        .with_analysis(pipeline(backend("MEDIUM", 5), Some(&log)));

    let report = run(&orchestrator).await;

    assert_eq!(report.analyses_completed, 1);
    assert_eq!(report.triggers_fired, 0);
    assert!(!log.exists());
    let text = std::fs::read_to_string(report.archives[0].report_path()).unwrap();
    assert!(text.contains("**Level:** MEDIUM"));
}

#[tokio::test]
async fn test_provider_error_does_not_stop_other_targets() {
    let fx = Fixture::new()
        .with_provider("afd", Arc::new(Broken))
        .with_pair("ntfs")
        .with_provider("tcpip", Arc::new(NoUpdate));
    let orchestrator = Orchestrator::new(fx.config(false), fx.registry.clone(), shell_engine());

    let report = run(&orchestrator).await;

    assert_eq!(report.targets_checked, 3);
    assert_eq!(report.provider_errors, 1);
    assert_eq!(report.no_update, 1);
    assert_eq!(report.jobs_succeeded, 1);
    assert_eq!(report.analyses_completed, 0);
    assert!(!report.archives[0].report_path().exists());
}

#[tokio::test]
async fn test_analyses_run_in_sequence_with_progress() {
    let fx = Fixture::new()
        .with_pair("afd")
        .with_pair("ntfs")
        .with_pair("tcpip");
    let backend = backend("NONE", 0);
    let config = RunConfig {
        analysis_delay: Duration::from_millis(10),
        ..fx.config(true)
    };
    let orchestrator = Orchestrator::new(config, fx.registry.clone(), shell_engine())
        .with_analysis(pipeline(backend.clone(), None));

    let mut observed = Vec::new();
    let report = orchestrator
        .run(&CancellationToken::new(), |p| observed.push(p))
        .await
        .unwrap();

    assert_eq!(report.jobs_succeeded, 3);
    assert_eq!(report.analyses_completed, 3);
    assert_eq!(backend.call_count(), 9);
    assert!(observed.iter().all(|p| p.total == 3));
    assert_eq!(observed.last().map(|p| p.remaining), Some(0));

    // Calls never interleave between archives: each run's three calls are
    // contiguous.
    let systems: Vec<String> = backend
        .calls()
        .iter()
        .map(|c| c[0].content.clone())
        .collect();
    for chunk in systems.chunks(3) {
        assert_eq!(chunk, ["PER", "SYN", "EVAL"]);
    }
}

#[tokio::test]
async fn test_cancelled_run_stops_before_providers() {
    let fx = Fixture::new().with_pair("afd");
    let orchestrator = Orchestrator::new(fx.config(false), fx.registry.clone(), shell_engine());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orchestrator.run(&cancel, |_| {}).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.targets_checked, 0);
    assert!(!fx.path("afd/old.afd.sys").exists());
}
