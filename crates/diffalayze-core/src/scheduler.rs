//! Bounded-concurrency diff job scheduling.
//!
//! Every submitted pair becomes one tokio task. With a bound `N > 0` a task
//! waits for a semaphore permit before the engine starts, so submission
//! never blocks and at most `N` engines run at any instant. A bound of `0`
//! acquires nothing.
//!
//! The job roster is the only state shared between jobs. `await_all` drives
//! completions from a [`JoinSet`] and feeds a progress observer on every
//! completion and on a fixed tick.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::archive::{archive_stamp, archive_work_dir, move_path, ArchiveEntry, ArchiveError};
use crate::engine::{verify_output, DiffEngine, DiffRequest, EngineError};
use crate::obs;
use crate::provider::ArtifactPair;
use crate::target::Target;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum simultaneously running engine invocations, `0` for unbounded.
    pub max_concurrent: usize,
    /// Interval between progress observer ticks.
    pub progress_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            progress_interval: Duration::from_millis(400),
        }
    }
}

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// First 8 characters, used for working directory names.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a diff job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Submitted => 0,
            JobState::Running => 1,
            JobState::Succeeded | JobState::Failed => 2,
        }
    }
}

/// Roster entry for one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub target: String,
    #[serde(skip)]
    pub pair: ArtifactPair,
    pub state: JobState,
    /// Working directory, kept in place when the job fails.
    pub work_dir: Option<PathBuf>,
    pub archive: Option<ArchiveEntry>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobRecord {
    fn new(id: JobId, target: &str, pair: ArtifactPair) -> Self {
        Self {
            id,
            target: target.to_string(),
            pair,
            state: JobState::Submitted,
            work_dir: None,
            archive: None,
            error: None,
            duration_ms: 0,
        }
    }

    /// Move to `next` if that is a step forward. Returns whether it moved.
    pub fn advance(&mut self, next: JobState) -> bool {
        if next.rank() > self.state.rank() {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// Snapshot handed to the progress observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    /// Jobs not yet in a terminal state.
    pub remaining: usize,
}

/// Outcome of [`DiffJobScheduler::await_all`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    /// Every job, in submission order.
    pub jobs: Vec<JobRecord>,
    /// Archives of successful jobs, in completion order.
    pub archives: Vec<ArchiveEntry>,
}

impl SchedulerReport {
    pub fn succeeded(&self) -> usize {
        self.count(JobState::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(JobState::Failed)
    }

    fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }
}

/// Reasons a single job fails.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("failed to prepare working directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("cancelled before start")]
    Cancelled,
}

type Roster = Arc<Mutex<Vec<JobRecord>>>;

/// State one spawned job needs.
struct JobContext {
    id: JobId,
    target: Target,
    pair: ArtifactPair,
    engine: Arc<dyn DiffEngine>,
    slots: Option<Arc<Semaphore>>,
    roster: Roster,
    archive_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

/// Runs diff jobs concurrently up to a bound.
pub struct DiffJobScheduler {
    engine: Arc<dyn DiffEngine>,
    config: SchedulerConfig,
    slots: Option<Arc<Semaphore>>,
    roster: Roster,
    archive_lock: Arc<Mutex<()>>,
    tasks: JoinSet<Option<ArchiveEntry>>,
    task_jobs: HashMap<tokio::task::Id, JobId>,
    cancel: CancellationToken,
}

impl DiffJobScheduler {
    pub fn new(engine: Arc<dyn DiffEngine>, config: SchedulerConfig, cancel: CancellationToken) -> Self {
        let slots = (config.max_concurrent > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent)));
        Self {
            engine,
            config,
            slots,
            roster: Arc::new(Mutex::new(Vec::new())),
            archive_lock: Arc::new(Mutex::new(())),
            tasks: JoinSet::new(),
            task_jobs: HashMap::new(),
            cancel,
        }
    }

    /// Number of jobs submitted so far.
    pub fn submitted(&self) -> usize {
        self.task_jobs.len()
    }

    /// Start one job. Returns immediately; the job waits for a slot on its own.
    pub async fn submit(&mut self, target: &Target, pair: ArtifactPair) -> JobId {
        let id = JobId::new();
        self.roster
            .lock()
            .await
            .push(JobRecord::new(id.clone(), &target.name, pair.clone()));
        obs::emit_job_submitted(id.as_str(), &target.name);

        let ctx = JobContext {
            id: id.clone(),
            target: target.clone(),
            pair,
            engine: Arc::clone(&self.engine),
            slots: self.slots.clone(),
            roster: Arc::clone(&self.roster),
            archive_lock: Arc::clone(&self.archive_lock),
            cancel: self.cancel.clone(),
        };
        let handle = self
            .tasks
            .spawn(run_job(ctx).instrument(obs::target_span(&target.name)));
        self.task_jobs.insert(handle.id(), id.clone());
        id
    }

    async fn progress(&self) -> Progress {
        let roster = self.roster.lock().await;
        Progress {
            total: roster.len(),
            remaining: roster.iter().filter(|j| !j.state.is_terminal()).count(),
        }
    }

    /// Wait until every submitted job is terminal, reporting progress.
    ///
    /// Returns even when jobs fail. A job whose task panicked is recorded
    /// as failed.
    pub async fn await_all<F>(&mut self, mut observer: F) -> SchedulerReport
    where
        F: FnMut(Progress),
    {
        let mut archives = Vec::new();
        let mut tick = tokio::time::interval(self.config.progress_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.tasks.is_empty() {
            tokio::select! {
                joined = self.tasks.join_next_with_id() => {
                    match joined {
                        Some(Ok((_, Some(entry)))) => archives.push(entry),
                        Some(Ok((_, None))) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "diff job task aborted");
                            if let Some(job) = self.task_jobs.get(&e.id()) {
                                let mut roster = self.roster.lock().await;
                                if let Some(record) = roster.iter_mut().find(|r| &r.id == job) {
                                    record.advance(JobState::Failed);
                                    record.error = Some(e.to_string());
                                }
                            }
                        }
                        None => break,
                    }
                    observer(self.progress().await);
                }
                _ = tick.tick() => {
                    let progress = self.progress().await;
                    obs::emit_progress(progress.total, progress.remaining);
                    observer(progress);
                }
            }
        }

        let jobs = std::mem::take(&mut *self.roster.lock().await);
        self.task_jobs.clear();
        info!(
            jobs = jobs.len(),
            archives = archives.len(),
            "all diff jobs finished"
        );
        SchedulerReport { jobs, archives }
    }
}

async fn update(roster: &Roster, id: &JobId, apply: impl FnOnce(&mut JobRecord)) {
    let mut roster = roster.lock().await;
    if let Some(record) = roster.iter_mut().find(|r| &r.id == id) {
        apply(record);
    }
}

/// Task body: wait for a slot, run, record the terminal state.
async fn run_job(ctx: JobContext) -> Option<ArchiveEntry> {
    let _permit = match &ctx.slots {
        Some(slots) => {
            let slots = Arc::clone(slots);
            tokio::select! {
                permit = slots.acquire_owned() => permit.ok(),
                _ = ctx.cancel.cancelled() => None,
            }
        }
        None => None,
    };

    let start = Instant::now();
    let outcome = if ctx.cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        update(&ctx.roster, &ctx.id, |r| {
            r.advance(JobState::Running);
        })
        .await;
        obs::emit_job_started(ctx.id.as_str(), &ctx.target.name);
        execute(&ctx).await
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let work_dir = ctx.target.work_root().join(ctx.id.short());
    let (state, archive, error) = match outcome {
        Ok(entry) => {
            info!(archive = %entry.dir.display(), "archived diff output");
            (JobState::Succeeded, Some(entry), None)
        }
        Err(e) => {
            warn!(error = %e, work_dir = %work_dir.display(), "diff job failed");
            (JobState::Failed, None, Some(e.to_string()))
        }
    };

    update(&ctx.roster, &ctx.id, |r| {
        r.advance(state);
        r.duration_ms = duration_ms;
        r.archive = archive.clone();
        r.error = error;
        if state == JobState::Failed && work_dir.exists() {
            r.work_dir = Some(work_dir.clone());
        }
    })
    .await;
    obs::emit_job_finished(
        ctx.id.as_str(),
        &ctx.target.name,
        state == JobState::Succeeded,
        duration_ms,
    );
    archive
}

/// Artifact names inside the working directory. Identical file names get
/// `old.`/`new.` prefixes so neither overwrites the other.
fn staged_names(pair: &ArtifactPair) -> (String, String) {
    let name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    };
    let (old, new) = (name(&pair.old), name(&pair.new));
    if old == new || old.is_empty() || new.is_empty() {
        let base = if old.is_empty() { "artifact".to_string() } else { old };
        (format!("old.{base}"), format!("new.{base}"))
    } else {
        (old, new)
    }
}

async fn execute(ctx: &JobContext) -> Result<ArchiveEntry, JobError> {
    let work_dir = ctx.target.work_root().join(ctx.id.short());
    prepare_work_dir(&work_dir)?;

    let (old_name, new_name) = staged_names(&ctx.pair);
    move_path(&ctx.pair.old, &work_dir.join(&old_name))?;
    move_path(&ctx.pair.new, &work_dir.join(&new_name))?;

    let request = DiffRequest {
        target: &ctx.target.name,
        work_dir: &work_dir,
        old_name: &old_name,
        new_name: &new_name,
    };
    ctx.engine.diff(&request, &ctx.cancel).await?;
    verify_output(&work_dir)?;

    // Stamp allocation and the move form one step so jobs finishing in the
    // same second never pick the same archive directory.
    let _guard = ctx.archive_lock.lock().await;
    let dir = archive_work_dir(&work_dir, &ctx.target.archive_root(), &archive_stamp())?;
    Ok(ArchiveEntry::new(ctx.target.name.clone(), dir))
}

fn prepare_work_dir(dir: &Path) -> Result<(), JobError> {
    let wrap = |source: std::io::Error| JobError::Prepare {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(wrap)?;
    // The engine may run as a different user inside a container.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).map_err(wrap)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Barrier;

    /// Engine that tracks peak concurrency and writes one document.
    #[derive(Default)]
    struct CountingEngine {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DiffEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        async fn diff(
            &self,
            request: &DiffRequest<'_>,
            _cancel: &CancellationToken,
        ) -> Result<(), EngineError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            std::fs::create_dir_all(request.work_dir.join("sxs_html")).unwrap();
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Engine that only finishes once `n` invocations are running together.
    struct BarrierEngine(Barrier);

    #[async_trait]
    impl DiffEngine for BarrierEngine {
        fn name(&self) -> &str {
            "barrier"
        }

        async fn diff(
            &self,
            request: &DiffRequest<'_>,
            _cancel: &CancellationToken,
        ) -> Result<(), EngineError> {
            self.0.wait().await;
            std::fs::create_dir_all(request.work_dir.join("sxs_html")).unwrap();
            Ok(())
        }
    }

    /// Fails for targets named `bad`, succeeds otherwise.
    struct PickyEngine;

    #[async_trait]
    impl DiffEngine for PickyEngine {
        fn name(&self) -> &str {
            "picky"
        }

        async fn diff(
            &self,
            request: &DiffRequest<'_>,
            _cancel: &CancellationToken,
        ) -> Result<(), EngineError> {
            if request.target == "bad" {
                return Err(EngineError::NonZeroExit {
                    code: 1,
                    stderr: "boom".to_string(),
                });
            }
            std::fs::create_dir_all(request.work_dir.join("sxs_html")).unwrap();
            Ok(())
        }
    }

    fn staged_target(root: &Path, name: &str) -> (Target, ArtifactPair) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let old = dir.join(format!("old.{name}.sys"));
        let new = dir.join(format!("new.{name}.sys"));
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();
        (Target::new(name, dir), ArtifactPair::new(old, new))
    }

    fn config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent,
            progress_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_bound_limits_concurrent_engines() {
        let tmp = tempdir().unwrap();
        let engine = Arc::new(CountingEngine::default());
        let mut scheduler = DiffJobScheduler::new(engine.clone(), config(2), CancellationToken::new());

        for i in 0..6 {
            let (target, pair) = staged_target(tmp.path(), &format!("t{i}"));
            scheduler.submit(&target, pair).await;
        }
        let report = scheduler.await_all(|_| {}).await;

        assert_eq!(report.succeeded(), 6);
        assert_eq!(report.archives.len(), 6);
        let peak = engine.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {peak} exceeded bound");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_zero_bound_runs_everything_at_once() {
        let tmp = tempdir().unwrap();
        let engine = Arc::new(BarrierEngine(Barrier::new(6)));
        let mut scheduler = DiffJobScheduler::new(engine, config(0), CancellationToken::new());

        for i in 0..6 {
            let (target, pair) = staged_target(tmp.path(), &format!("t{i}"));
            scheduler.submit(&target, pair).await;
        }
        let report = tokio::time::timeout(Duration::from_secs(5), scheduler.await_all(|_| {}))
            .await
            .expect("jobs were not all running together");
        assert_eq!(report.succeeded(), 6);
    }

    #[tokio::test]
    async fn test_failed_job_is_isolated() {
        let tmp = tempdir().unwrap();
        let mut scheduler =
            DiffJobScheduler::new(Arc::new(PickyEngine), config(4), CancellationToken::new());

        let (bad, bad_pair) = staged_target(tmp.path(), "bad");
        let (good, good_pair) = staged_target(tmp.path(), "good");
        scheduler.submit(&bad, bad_pair).await;
        scheduler.submit(&good, good_pair).await;

        let mut ticks = Vec::new();
        let report = scheduler.await_all(|p| ticks.push(p)).await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.archives.len(), 1);
        assert_eq!(report.archives[0].target, "good");
        assert!(report.archives[0].documents_dir().is_dir());

        let failed = report.jobs.iter().find(|j| j.target == "bad").unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.error.as_deref().unwrap().contains("boom"));
        // Working directory and artifacts stay for inspection.
        let work_dir = failed.work_dir.as_ref().unwrap();
        assert!(work_dir.join("old.bad.sys").is_file());
        assert!(!bad.archive_root().exists());

        assert_eq!(ticks.last().map(|p| p.remaining), Some(0));
    }

    #[tokio::test]
    async fn test_missing_documents_fails_job() {
        struct SilentEngine;

        #[async_trait]
        impl DiffEngine for SilentEngine {
            fn name(&self) -> &str {
                "silent"
            }

            async fn diff(
                &self,
                _request: &DiffRequest<'_>,
                _cancel: &CancellationToken,
            ) -> Result<(), EngineError> {
                Ok(())
            }
        }

        let tmp = tempdir().unwrap();
        let mut scheduler =
            DiffJobScheduler::new(Arc::new(SilentEngine), config(1), CancellationToken::new());
        let (target, pair) = staged_target(tmp.path(), "afd");
        scheduler.submit(&target, pair).await;
        let report = scheduler.await_all(|_| {}).await;
        assert_eq!(report.failed(), 1);
        assert!(report.archives.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let tmp = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = Arc::new(CountingEngine::default());
        let mut scheduler = DiffJobScheduler::new(engine.clone(), config(1), cancel);
        let (target, pair) = staged_target(tmp.path(), "afd");
        scheduler.submit(&target, pair.clone()).await;

        let report = scheduler.await_all(|_| {}).await;
        assert_eq!(report.failed(), 1);
        assert_eq!(engine.peak.load(Ordering::SeqCst), 0);
        // Artifacts are untouched.
        assert!(pair.old.is_file());
    }

    #[tokio::test]
    async fn test_await_all_without_jobs() {
        let mut scheduler =
            DiffJobScheduler::new(Arc::new(PickyEngine), config(1), CancellationToken::new());
        let report = scheduler.await_all(|_| {}).await;
        assert!(report.jobs.is_empty());
        assert_eq!(scheduler.submitted(), 0);
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let mut record = JobRecord::new(JobId::new(), "afd", ArtifactPair::new("a", "b"));
        assert!(record.advance(JobState::Running));
        assert!(!record.advance(JobState::Submitted));
        assert!(record.advance(JobState::Failed));
        assert!(!record.advance(JobState::Succeeded));
        assert!(!record.advance(JobState::Running));
        assert_eq!(record.state, JobState::Failed);
    }

    #[test]
    fn test_staged_names() {
        assert_eq!(
            staged_names(&ArtifactPair::new("/a/old.afd.sys", "/b/new.afd.sys")),
            ("old.afd.sys".to_string(), "new.afd.sys".to_string())
        );
        assert_eq!(
            staged_names(&ArtifactPair::new("/a/afd.sys", "/b/afd.sys")),
            ("old.afd.sys".to_string(), "new.afd.sys".to_string())
        );
    }

    #[test]
    fn test_job_id_short() {
        let id = JobId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.as_str().starts_with(id.short()));
    }
}
