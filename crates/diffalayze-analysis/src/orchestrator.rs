//! One full run: fetch, diff, analyze.

use anyhow::{bail, Context};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use diffalayze_core::{
    obs, select_targets, ArchiveEntry, ArtifactPair, DiffEngine, DiffJobScheduler, FetchOutcome,
    Progress, ProviderRegistry, SchedulerConfig, Target, TargetSelector,
};

use crate::pipeline::AnalysisPipeline;

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub targets_root: PathBuf,
    pub selector: TargetSelector,
    /// Forget recorded versions so the latest pair is fetched again.
    pub force: bool,
    /// Run the analysis pipeline over every new archive.
    pub analyze: bool,
    /// Pause between two analysis runs.
    pub analysis_delay: Duration,
    pub scheduler: SchedulerConfig,
}

impl RunConfig {
    pub fn new(targets_root: impl Into<PathBuf>, selector: TargetSelector) -> Self {
        Self {
            targets_root: targets_root.into(),
            selector,
            force: false,
            analyze: false,
            analysis_delay: Duration::ZERO,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Counts and artifacts of a finished run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub targets_checked: usize,
    pub no_update: usize,
    /// Targets without a usable provider.
    pub skipped: usize,
    pub provider_errors: usize,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub analyses_completed: usize,
    pub analyses_failed: usize,
    pub triggers_fired: usize,
    pub archives: Vec<ArchiveEntry>,
    pub reports: Vec<PathBuf>,
    /// The run stopped early on cancellation.
    pub cancelled: bool,
}

enum Checked {
    Pair(ArtifactPair),
    NoUpdate,
    Skipped,
    ProviderError,
    Cancelled,
}

pub struct Orchestrator {
    config: RunConfig,
    registry: ProviderRegistry,
    engine: Arc<dyn DiffEngine>,
    pipeline: Option<AnalysisPipeline>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, registry: ProviderRegistry, engine: Arc<dyn DiffEngine>) -> Self {
        Self {
            config,
            registry,
            engine,
            pipeline: None,
        }
    }

    pub fn with_analysis(mut self, pipeline: AnalysisPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every selected target through fetch and diff, then analyze the
    /// new archives one at a time.
    ///
    /// Only target selection and configuration problems are returned as
    /// errors. Provider, engine and analysis failures are counted in the
    /// report and logged.
    pub async fn run<F>(&self, cancel: &CancellationToken, progress: F) -> anyhow::Result<RunReport>
    where
        F: FnMut(Progress),
    {
        if self.config.analyze && self.pipeline.is_none() {
            bail!("analysis requested but no analysis pipeline is configured");
        }
        let targets = select_targets(&self.config.targets_root, &self.config.selector)
            .with_context(|| {
                format!(
                    "cannot select target '{}' under {}",
                    self.config.selector,
                    self.config.targets_root.display()
                )
            })?;
        info!(targets = targets.len(), selector = %self.config.selector, "run started");

        let mut report = RunReport::default();
        let mut scheduler =
            DiffJobScheduler::new(Arc::clone(&self.engine), self.config.scheduler.clone(), cancel.clone());

        for target in &targets {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.targets_checked += 1;
            let checked = self
                .check_target(target, cancel)
                .instrument(obs::target_span(&target.name))
                .await;
            match checked {
                Checked::Pair(pair) => {
                    scheduler.submit(target, pair).await;
                }
                Checked::NoUpdate => report.no_update += 1,
                Checked::Skipped => report.skipped += 1,
                Checked::ProviderError => report.provider_errors += 1,
                Checked::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }
        }

        let jobs = scheduler.await_all(progress).await;
        report.jobs_succeeded = jobs.succeeded();
        report.jobs_failed = jobs.failed();
        report.archives = jobs.archives;

        if self.config.analyze {
            self.analyze_archives(&mut report, cancel).await;
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
        }

        info!(
            targets = report.targets_checked,
            jobs_succeeded = report.jobs_succeeded,
            jobs_failed = report.jobs_failed,
            analyses = report.analyses_completed,
            triggers = report.triggers_fired,
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }

    async fn check_target(&self, target: &Target, cancel: &CancellationToken) -> Checked {
        if self.config.force {
            match target.reset_version_tracking() {
                Ok(true) => info!("version tracking reset"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "cannot reset version tracking"),
            }
        }

        let provider = match self.registry.resolve(target) {
            Ok(Some(provider)) => provider,
            Ok(None) => {
                warn!("no provider configured, skipping target");
                return Checked::Skipped;
            }
            // A broken target.toml only takes its own target out of the run.
            Err(e) => {
                warn!(error = %e, "invalid target configuration, skipping target");
                return Checked::Skipped;
            }
        };

        let fetched = tokio::select! {
            fetched = provider.check_and_fetch() => fetched,
            _ = cancel.cancelled() => return Checked::Cancelled,
        };
        match fetched {
            Ok(FetchOutcome::NoUpdate) => {
                info!(provider = provider.kind(), "no new version");
                Checked::NoUpdate
            }
            Ok(FetchOutcome::Pair(pair)) => match pair.validate() {
                Ok(()) => {
                    info!(
                        provider = provider.kind(),
                        old = %pair.old.display(),
                        new = %pair.new.display(),
                        "new version pair"
                    );
                    Checked::Pair(pair)
                }
                Err(e) => {
                    warn!(provider = provider.kind(), error = %e, "provider returned an unusable pair");
                    Checked::ProviderError
                }
            },
            Err(e) => {
                warn!(provider = provider.kind(), error = %e, "provider failed");
                Checked::ProviderError
            }
        }
    }

    async fn analyze_archives(&self, report: &mut RunReport, cancel: &CancellationToken) {
        let Some(pipeline) = &self.pipeline else {
            return;
        };
        let archives = report.archives.clone();
        for (index, entry) in archives.iter().enumerate() {
            if index > 0 && !self.config.analysis_delay.is_zero() {
                info!(delay_secs = self.config.analysis_delay.as_secs(), "pausing before next analysis");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.analysis_delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match pipeline.run(entry, cancel).await {
                Ok(outcome) => {
                    report.analyses_completed += 1;
                    if outcome.trigger.fired() {
                        report.triggers_fired += 1;
                    }
                    report.reports.push(outcome.report_path);
                }
                Err(e) if e.is_cancelled() => {
                    warn!(target = %entry.target, "analysis cancelled");
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(target = %entry.target, archive = %entry.dir.display(), error = %e, "analysis failed");
                    report.analyses_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffalayze_core::{CommandEngine, EngineConfig};
    use tempfile::tempdir;

    fn engine() -> Arc<dyn DiffEngine> {
        Arc::new(CommandEngine::new(vec!["true".to_string()], EngineConfig::default()))
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let tmp = tempdir().unwrap();
        let config = RunConfig::new(tmp.path().join("missing"), TargetSelector::All);
        let orchestrator = Orchestrator::new(config, ProviderRegistry::with_builtin(), engine());
        let err = orchestrator
            .run(&CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot select target 'all'"));
    }

    #[tokio::test]
    async fn test_analysis_without_pipeline_is_fatal() {
        let tmp = tempdir().unwrap();
        let config = RunConfig {
            analyze: true,
            ..RunConfig::new(tmp.path(), TargetSelector::All)
        };
        let orchestrator = Orchestrator::new(config, ProviderRegistry::with_builtin(), engine());
        assert!(orchestrator.run(&CancellationToken::new(), |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_target_config_errors_are_isolated() {
        let tmp = tempdir().unwrap();
        for name in ["afd", "ntfs", "srv2"] {
            std::fs::create_dir(tmp.path().join(name)).unwrap();
        }
        std::fs::write(tmp.path().join("ntfs").join("target.toml"), "provider = \"ftp\"").unwrap();
        std::fs::write(tmp.path().join("srv2").join("target.toml"), "provider = [").unwrap();

        let config = RunConfig::new(tmp.path(), TargetSelector::All);
        let report = Orchestrator::new(config, ProviderRegistry::with_builtin(), engine())
            .run(&CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(report.targets_checked, 3);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.provider_errors, 0);
        assert_eq!(report.jobs_succeeded + report.jobs_failed, 0);
        assert!(!report.cancelled);
    }
}
