//! diffalayze - automated binary patch diffing with LLM-assisted triage
//!
//! ## Commands
//!
//! - `run`: check targets for new versions, diff them, optionally analyze
//! - `analyze`: run the analysis pipeline over one existing archive
//! - `targets`: list discovered targets and their providers

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use diffalayze_analysis::{
    AnalysisPipeline, Orchestrator, PromptSet, RunConfig, RunReport, TriggerAction, TriggerGate,
    TriggerOutcome,
};
use diffalayze_core::{
    discover_targets, ArchiveEntry, CommandEngine, DiffEngine, EngineConfig, GhidriffEngine,
    Progress, ProviderRegistry, SchedulerConfig, Severity, TargetSelector,
    DEFAULT_GHIDRIFF_IMAGE,
};
use diffalayze_llm::{BackendKind, BackendSettings, ModelClient};

#[derive(Parser)]
#[command(name = "diffalayze")]
#[command(version = diffalayze_core::VERSION)]
#[command(about = "Automated binary patch diffing with LLM-assisted triage", long_about = None)]
struct Cli {
    /// Enable verbose output (debug logs, engine output)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and a JSON summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check targets for new versions, diff them and optionally analyze the diffs
    Run(RunArgs),

    /// Run the analysis pipeline over one existing diff archive
    Analyze(AnalyzeArgs),

    /// List discovered targets and their provider kinds
    Targets {
        /// Directory holding one subdirectory per target
        #[arg(long, env = "DIFFALAYZE_TARGETS", default_value = "targets")]
        targets_dir: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Target name or 'all'
    target: TargetSelector,

    /// Fetch again even if the version is unchanged
    #[arg(short, long)]
    force: bool,

    /// Analyze every newly archived diff
    #[arg(short, long)]
    analyze: bool,

    /// Max concurrent diff jobs (0 = unlimited)
    #[arg(short = 't', long = "threads", visible_alias = "ghidriff-threads", default_value_t = 4)]
    threads: usize,

    /// Directory holding one subdirectory per target
    #[arg(long, env = "DIFFALAYZE_TARGETS", default_value = "targets")]
    targets_dir: PathBuf,

    /// Seconds to pause between two analyses
    #[arg(long, default_value_t = 0)]
    llm_sleep: u64,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(flatten)]
    llm: LlmArgs,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Archive directory (or a documents directory)
    #[arg(short, long)]
    input: PathBuf,

    /// Report path (default: <input>/analysis.md)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target name used in logs and the trigger payload
    #[arg(long, default_value = "target")]
    target_name: String,

    #[command(flatten)]
    llm: LlmArgs,
}

#[derive(Args)]
struct EngineArgs {
    /// ghidriff container image
    #[arg(long, default_value = DEFAULT_GHIDRIFF_IMAGE)]
    engine_image: String,

    /// Custom diff command instead of ghidriff; `{work_dir}`, `{old}` and
    /// `{new}` are substituted
    #[arg(long)]
    engine_cmd: Option<String>,

    /// Seconds before a diff job is killed (0 = no limit)
    #[arg(long, default_value_t = 4 * 60 * 60)]
    engine_timeout: u64,
}

#[derive(Args)]
struct LlmArgs {
    /// Prompt configuration (YAML)
    #[arg(long, env = "DIFFALAYZE_PROMPTS", default_value = "config/prompts.yaml")]
    prompts: PathBuf,

    /// Model backend: ollama, openai or anthropic
    #[arg(long, default_value = "ollama")]
    llm_backend: String,

    /// Model name (backend default when omitted)
    #[arg(long)]
    llm_model: Option<String>,

    /// Minimum evaluated level that fires the trigger command
    #[arg(long, default_value = "HIGH")]
    llm_threshold: Severity,

    /// Command run with `<target> <score> <level>` on stdin when the
    /// threshold is reached
    #[arg(long)]
    llm_trigger_cmd: Option<String>,

    /// Seconds allowed per model call (0 = no limit)
    #[arg(long, default_value_t = 600)]
    llm_timeout: u64,

    /// Seconds allowed for the trigger command (0 = no limit)
    #[arg(long, default_value_t = 300)]
    trigger_timeout: u64,
}

fn limit(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    diffalayze_core::init_tracing(cli.json, level);

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        watcher.cancel();
    });

    match cli.command {
        Commands::Run(args) => cmd_run(args, cli.verbose, cli.json, &cancel).await,
        Commands::Analyze(args) => cmd_analyze(args, cli.json, &cancel).await,
        Commands::Targets { targets_dir } => cmd_targets(&targets_dir, cli.json),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, stopping"),
        _ = terminate => info!("received terminate signal, stopping"),
    }
}

/// Build the analysis pipeline, failing on any configuration problem
/// before work starts.
fn build_pipeline(args: &LlmArgs) -> Result<AnalysisPipeline> {
    let prompts = PromptSet::load(&args.prompts)
        .with_context(|| format!("cannot load prompts from {}", args.prompts.display()))?;
    let kind: BackendKind = args
        .llm_backend
        .parse()
        .context("invalid --llm-backend")?;
    let settings = BackendSettings {
        kind,
        model: args.llm_model.clone(),
        timeout: limit(args.llm_timeout).unwrap_or(Duration::from_secs(u32::MAX as u64)),
        ..BackendSettings::default()
    };
    let backend = diffalayze_llm::from_env(&settings)
        .with_context(|| format!("cannot configure {kind} backend"))?;
    info!(backend = backend.name(), model = backend.model(), "model backend ready");
    let client =
        ModelClient::new(backend, settings.temperature).with_call_timeout(limit(args.llm_timeout));

    let action = args
        .llm_trigger_cmd
        .as_deref()
        .map(|cmd| TriggerAction::parse(cmd, limit(args.trigger_timeout)))
        .transpose()
        .context("invalid --llm-trigger-cmd")?;
    let gate = TriggerGate::new(action, args.llm_threshold);

    Ok(AnalysisPipeline::new(client, Arc::new(prompts), gate))
}

fn build_engine(args: &EngineArgs, verbose: bool) -> Result<Arc<dyn DiffEngine>> {
    let config = EngineConfig {
        image: args.engine_image.clone(),
        timeout: limit(args.engine_timeout),
        verbose,
    };
    Ok(match &args.engine_cmd {
        Some(cmd) => {
            let argv = diffalayze_analysis::split_command(cmd).context("invalid --engine-cmd")?;
            Arc::new(CommandEngine::new(argv, config))
        }
        None => Arc::new(GhidriffEngine::new(config)),
    })
}

/// Logs scheduler progress whenever the remaining count changes.
fn progress_logger() -> impl FnMut(Progress) {
    let mut last = None;
    move |progress: Progress| {
        if last != Some(progress.remaining) {
            last = Some(progress.remaining);
            info!(
                remaining = progress.remaining,
                total = progress.total,
                "diff jobs in progress"
            );
        }
    }
}

async fn cmd_run(args: RunArgs, verbose: bool, json: bool, cancel: &CancellationToken) -> Result<()> {
    let engine = build_engine(&args.engine, verbose)?;
    let config = RunConfig {
        targets_root: args.targets_dir.clone(),
        selector: args.target.clone(),
        force: args.force,
        analyze: args.analyze,
        analysis_delay: Duration::from_secs(args.llm_sleep),
        scheduler: SchedulerConfig {
            max_concurrent: args.threads,
            ..SchedulerConfig::default()
        },
    };

    let mut orchestrator = Orchestrator::new(config, ProviderRegistry::with_builtin(), engine);
    if args.analyze {
        orchestrator = orchestrator.with_analysis(build_pipeline(&args.llm)?);
    }

    let report = orchestrator.run(cancel, progress_logger()).await?;
    print_run_report(&report, json)?;
    if report.cancelled {
        warn!("run was cancelled before completion");
    }
    Ok(())
}

fn print_run_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Targets checked:   {}", report.targets_checked);
    println!("  no update:       {}", report.no_update);
    println!("  skipped:         {}", report.skipped);
    println!("  provider errors: {}", report.provider_errors);
    println!(
        "Diff jobs:         {} succeeded, {} failed",
        report.jobs_succeeded, report.jobs_failed
    );
    for entry in &report.archives {
        println!("  {} -> {}", entry.target, entry.dir.display());
    }
    if report.analyses_completed + report.analyses_failed > 0 {
        println!(
            "Analyses:          {} completed, {} failed, {} trigger(s) fired",
            report.analyses_completed, report.analyses_failed, report.triggers_fired
        );
        for path in &report.reports {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct AnalyzeSummary<'a> {
    target: &'a str,
    report: &'a Path,
    documents: usize,
    level: &'a str,
    score: String,
    summary: &'a str,
    trigger: &'a TriggerOutcome,
}

async fn cmd_analyze(args: AnalyzeArgs, json: bool, cancel: &CancellationToken) -> Result<()> {
    let pipeline = build_pipeline(&args.llm)?;

    // An archive holds its documents in a subdirectory; a bare documents
    // directory is accepted too.
    let entry = ArchiveEntry::new(&args.target_name, &args.input);
    let docs_dir = if entry.documents_dir().is_dir() {
        entry.documents_dir()
    } else {
        args.input.clone()
    };
    let output = args.output.clone().unwrap_or_else(|| entry.report_path());
    info!(input = %docs_dir.display(), "analyzing documents");

    let outcome = pipeline
        .run_to(&args.target_name, &docs_dir, &output, cancel)
        .await
        .with_context(|| format!("analysis of {} failed", args.input.display()))?;

    if json {
        let summary = AnalyzeSummary {
            target: &outcome.target,
            report: &outcome.report_path,
            documents: outcome.documents,
            level: outcome.evaluation.level_label(),
            score: outcome.evaluation.score.to_string(),
            summary: &outcome.evaluation.summary,
            trigger: &outcome.trigger,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Report:  {}", outcome.report_path.display());
        println!("Level:   {}", outcome.evaluation.level_label());
        println!("Score:   {}", outcome.evaluation.score);
        println!("Summary: {}", outcome.evaluation.summary);
        if outcome.trigger.fired() {
            println!("Trigger: fired");
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct TargetRow {
    name: String,
    dir: PathBuf,
    provider: String,
}

fn cmd_targets(root: &Path, json: bool) -> Result<()> {
    let targets = discover_targets(root)
        .with_context(|| format!("cannot list targets under {}", root.display()))?;

    let rows: Vec<TargetRow> = targets
        .into_iter()
        .map(|target| {
            let provider = match target.load_config() {
                Ok(Some(config)) => config.provider,
                Ok(None) => "-".to_string(),
                Err(e) => format!("invalid ({e})"),
            };
            TargetRow {
                name: target.name,
                dir: target.dir,
                provider,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No targets under {}", root.display());
        return Ok(());
    }
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for row in &rows {
        println!("{:width$}  {}", row.name, row.provider, width = width);
    }
    Ok(())
}
