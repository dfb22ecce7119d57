//! Command-line interface for vmsetup.
//!
//! Provides commands for running provisioning pipelines, inspecting and
//! resetting the completion ledger, probing tool versions, and browsing
//! past runs.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use uuid::Uuid;

use crate::adapters::EnvironmentProbe;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    load_pipeline, recent_runs, ArtifactCache, DirCache, Ledger, MarkerLedger, Pipeline,
    PipelineRunner, RunJournal,
};
use crate::domain::{DiscoveredEnv, PipelineResult};

const DEFAULT_PIPELINE: &str = "provision";

/// vmsetup - Resumable, idempotent machine provisioning
#[derive(Parser, Debug)]
#[command(name = "vmsetup")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline, skipping steps already completed
    Run {
        /// Pipeline name (looks for pipelines/<name>.yaml) or path
        #[arg(default_value = DEFAULT_PIPELINE)]
        pipeline: String,

        /// Ignore the artifact cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Skip the tool version report
        #[arg(long)]
        no_probe: bool,
    },

    /// Show which steps are complete
    Status {
        /// Pipeline name or path
        #[arg(default_value = DEFAULT_PIPELINE)]
        pipeline: String,
    },

    /// Forget completion so a step runs again
    Reset {
        /// Step name
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        step: Option<String>,

        /// Forget every step
        #[arg(long)]
        all: bool,
    },

    /// Report installed tool versions
    Probe {
        /// Pipeline whose tools and exports to use
        #[arg(default_value = DEFAULT_PIPELINE)]
        pipeline: String,
    },

    /// List artifact cache entries
    Cache,

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the recorded steps of a run
    Show {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline,
                no_cache,
                no_probe,
            } => run_pipeline(&pipeline, no_cache, no_probe).await,
            Commands::Status { pipeline } => show_status(&pipeline).await,
            Commands::Reset { step, all } => reset(step.as_deref(), all).await,
            Commands::Probe { pipeline } => probe(&pipeline).await,
            Commands::Cache => list_cache().await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Show { run_id } => show_run(&run_id).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Hold an exclusive lock on the state directory; released on drop
fn acquire_lock(cfg: &ResolvedConfig) -> Result<std::fs::File> {
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create home directory: {}", cfg.home.display()))?;

    let lock_path = cfg.lock_path();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

    file.try_lock_exclusive().with_context(|| {
        format!(
            "Another vmsetup process holds {}; wait for it to finish",
            lock_path.display()
        )
    })?;

    Ok(file)
}

/// Environment exported by the steps the ledger already has
async fn completed_exports(pipeline: &Pipeline, ledger: &dyn Ledger) -> DiscoveredEnv {
    let mut env = DiscoveredEnv::default();
    for step in &pipeline.steps {
        if ledger.is_complete(&step.name).await {
            env.merge(&step.exports_env());
        }
    }
    env
}

/// Run a pipeline and print its summary
async fn run_pipeline(pipeline_name: &str, no_cache: bool, no_probe: bool) -> Result<()> {
    let cfg = config::config()?;
    let _lock = acquire_lock(cfg)?;

    let pipeline = load_pipeline(pipeline_name, &cfg.pipelines_dir)?;
    let steps = pipeline.build_steps(&cfg.shell, &cfg.arch);

    let mut runner = PipelineRunner::new(Arc::new(MarkerLedger::new(cfg.ledger_dir())))
        .named(&pipeline.name)
        .with_journal(cfg.runs_dir());

    if cfg.cache_enabled && !no_cache {
        runner = runner.with_cache(Arc::new(DirCache::new(&cfg.cache_root)));
    }

    let result = runner.run(&steps).await?;
    print_summary(&pipeline, &result);

    if !no_probe {
        let probe = EnvironmentProbe::for_tools(&pipeline.tools);
        println!("\nInstalled tools:");
        for version in probe.probe(&result.env).await {
            println!("  {}", version);
        }
    }

    if !result.is_success() {
        std::process::exit(result.exit_code());
    }

    Ok(())
}

fn print_summary(pipeline: &Pipeline, result: &PipelineResult) {
    println!("\nPipeline: {}", pipeline.name);
    println!("Run:      {}", result.run_id);
    println!();

    for report in &result.reports {
        println!(
            "  {:<24} {:<14} {}",
            report.name,
            report.outcome.label(),
            if report.duration_ms > 0 {
                format!("{}ms", report.duration_ms)
            } else {
                String::new()
            }
        );
    }

    println!();
    println!(
        "Completed: {} ({} from cache)  Skipped: {}  Not attempted: {}",
        result.completed.len(),
        result.restored.len(),
        result.skipped.len(),
        result.not_attempted.len()
    );

    if let Some(failure) = &result.failed {
        eprintln!("\n[Step '{}' failed: {}]", failure.step, failure.kind);
        if !result.not_attempted.is_empty() {
            eprintln!(
                "Remaining steps were not attempted: {}",
                result.not_attempted.join(", ")
            );
        }
        eprintln!("Fix the problem and re-run; completed steps will be skipped.");
    }
}

/// Show per-step completion for a pipeline
async fn show_status(pipeline_name: &str) -> Result<()> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(pipeline_name, &cfg.pipelines_dir)?;
    let ledger = MarkerLedger::new(cfg.ledger_dir());

    println!("Pipeline: {}", pipeline.name);
    println!("Ledger:   {}", ledger.dir().display());
    println!();
    println!("{:<24} {:<10} {}", "STEP", "STATE", "COMPLETED AT");
    println!("{}", "-".repeat(60));

    for step in &pipeline.steps {
        if !ledger.is_complete(&step.name).await {
            println!("{:<24} {:<10}", step.name, "pending");
            continue;
        }
        // Presence decides completion; the body is only informational
        let completed_at = match ledger.marker(&step.name).await {
            Ok(Some(marker)) => marker.completed_at.to_rfc3339(),
            _ => "unknown".to_string(),
        };
        println!("{:<24} {:<10} {}", step.name, "done", completed_at);
    }

    let unknown: Vec<String> = ledger
        .completed()
        .await?
        .into_iter()
        .filter(|name| pipeline.get_step(name).is_none())
        .collect();

    if !unknown.is_empty() {
        println!("\nMarkers not in this pipeline: {}", unknown.join(", "));
    }

    Ok(())
}

/// Remove one or all completion markers
async fn reset(step: Option<&str>, all: bool) -> Result<()> {
    let cfg = config::config()?;
    let _lock = acquire_lock(cfg)?;
    let ledger = MarkerLedger::new(cfg.ledger_dir());

    if all {
        ledger.reset_all().await?;
        eprintln!("Cleared all completion markers in {}", ledger.dir().display());
        return Ok(());
    }

    let name = step.context("Specify a step name or --all")?;
    if !ledger.is_complete(name).await {
        eprintln!("Step '{}' was not marked complete", name);
    }
    ledger.reset(name).await?;
    eprintln!("Step '{}' will run again on the next run", name);

    Ok(())
}

/// Report tool versions using exports of completed steps
async fn probe(pipeline_name: &str) -> Result<()> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(pipeline_name, &cfg.pipelines_dir)?;
    let ledger = MarkerLedger::new(cfg.ledger_dir());

    let env = completed_exports(&pipeline, &ledger).await;
    let probe = EnvironmentProbe::for_tools(&pipeline.tools);

    for version in probe.probe(&env).await {
        println!("{}", version);
    }

    Ok(())
}

/// List artifact cache entries
async fn list_cache() -> Result<()> {
    let cfg = config::config()?;
    let cache = DirCache::new(&cfg.cache_root);

    println!("Cache root: {}", cache.root().display());
    println!(
        "Available:  {}{}",
        if cache.available().await { "yes" } else { "no" },
        if cfg.cache_enabled { "" } else { " (disabled in config)" }
    );

    let entries = cache.entries().await?;
    if entries.is_empty() {
        println!("\nNo cache entries");
        return Ok(());
    }

    println!();
    println!("{:<36} {:>12} {:<25}", "KEY", "SIZE", "CREATED");
    println!("{}", "-".repeat(75));
    for entry in entries {
        println!(
            "{:<36} {:>12} {:<25}",
            entry.key.to_string(),
            entry.size_bytes,
            entry.created_at.to_rfc3339()
        );
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let runs = recent_runs(&cfg.runs_dir(), limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {:<25}", "RUN ID", "PIPELINE", "STATE", "STARTED");
    println!("{}", "-".repeat(95));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<12} {:<25}",
            run.id,
            run.pipeline_name,
            run.state.to_string(),
            run.started_at.to_rfc3339()
        );
    }

    Ok(())
}

/// Show the recorded state of one run
async fn show_run(run_id_str: &str) -> Result<()> {
    let run_id =
        Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let cfg = config::config()?;
    let runs_dir = cfg.runs_dir();
    if !run_exists(&runs_dir, run_id) {
        anyhow::bail!("Run not found: {}", run_id);
    }

    let journal = RunJournal::open(&runs_dir, run_id).await?;
    let run = journal
        .record()
        .await?
        .with_context(|| format!("Run {} has no events", run_id))?;

    println!("Run ID:   {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("State:    {}", run.state);
    println!("Started:  {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Finished: {}", completed);
    }
    if let crate::domain::RunState::Failed { error } = &run.state {
        println!("Error:    {}", error);
    }
    if run.is_running() {
        println!("(no terminal event: still running or interrupted)");
    }

    println!("\nStep statuses:");
    for (step, status) in &run.steps {
        println!("  {}: {}", step, status);
    }

    Ok(())
}

fn run_exists(runs_dir: &Path, run_id: Uuid) -> bool {
    runs_dir.join(run_id.to_string()).join("events.jsonl").is_file()
}

/// Show the resolved configuration (for debugging)
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Ledger:              {}", cfg.ledger_dir().display());
    println!("  Runs:                {}", cfg.runs_dir().display());
    println!("  Pipelines:           {}", cfg.pipelines_dir.display());
    println!("  Cache root:          {}", cfg.cache_root.display());
    println!();
    println!("Cache enabled: {}", cfg.cache_enabled);
    println!("Arch:          {}", cfg.arch);
    println!("Shell:         {}", cfg.shell);

    Ok(())
}
