//! Command-line interface for roundtable.
//!
//! Provides commands for running pipelines (once or over a directory),
//! merging translation fragments, running a normalized shell command,
//! checking run status and listing runs.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{merge_fragments, scan_keys, ShellCommand};
use crate::config::{self, ResolvedConfig};
use crate::core::{backend_from_config, CancelHandle, MergeSpec, Orchestrator, Pipeline, RunOptions, RunOutcome};
use crate::domain::{ExhaustReason, RunState};

/// roundtable - Round-based pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "roundtable")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline for one request
    Run {
        /// Pipeline name (will look for pipelines/<name>.yaml)
        pipeline_name: String,

        /// Request text, e.g. a file path (reads stdin if not provided)
        request: Option<String>,

        /// Maximum number of rounds
        #[arg(short, long)]
        rounds: Option<u32>,

        /// Cost budget in USD
        #[arg(short, long)]
        investment: Option<f64>,

        /// Do not write a run journal
        #[arg(long)]
        no_journal: bool,
    },

    /// Run a pipeline once per file in a directory
    Batch {
        /// Pipeline name
        pipeline_name: String,

        /// Directory holding the input files
        dir: PathBuf,

        /// Glob pattern selecting input files
        #[arg(short, long, default_value = "*")]
        pattern: String,

        /// Glob pattern of fragments to merge afterwards
        #[arg(long, requires = "merge_into")]
        merge_pattern: Option<String>,

        /// File receiving the merged fragments
        #[arg(long, requires = "merge_pattern")]
        merge_into: Option<PathBuf>,

        /// Maximum number of rounds per file
        #[arg(short, long)]
        rounds: Option<u32>,

        /// Cost budget in USD per file
        #[arg(short, long)]
        investment: Option<f64>,
    },

    /// Merge JSON fragment files into one table
    Merge {
        /// Directory holding the fragments
        dir: PathBuf,

        /// Glob pattern selecting fragments
        #[arg(short, long, default_value = "*-fanyi.json")]
        pattern: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List localization keys (`L["..."]`) used by page sources
    Keys {
        /// Directory to scan recursively
        dir: PathBuf,

        /// Source file extension (repeatable)
        #[arg(short, long = "ext", default_values = ["razor", "cs"])]
        extensions: Vec<String>,
    },

    /// Run a command line with the required program prefix
    Exec {
        /// Command line, with or without the program name
        command: String,

        /// Required program (defaults to the configured one)
        #[arg(short, long)]
        program: Option<String>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print every artifact's content
        #[arg(short, long)]
        full: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline_name,
                request,
                rounds,
                investment,
                no_journal,
            } => run_pipeline(&pipeline_name, request, rounds, investment, no_journal).await,
            Commands::Batch {
                pipeline_name,
                dir,
                pattern,
                merge_pattern,
                merge_into,
                rounds,
                investment,
            } => {
                let merge = merge_pattern
                    .zip(merge_into)
                    .map(|(pattern, output)| MergeSpec { pattern, output });
                run_batch(&pipeline_name, &dir, &pattern, merge, rounds, investment).await
            }
            Commands::Merge { dir, pattern, output } => merge(&dir, &pattern, &output).await,
            Commands::Keys { dir, extensions } => keys(&dir, &extensions).await,
            Commands::Exec { command, program } => exec(&command, program).await,
            Commands::Status { run_id, full } => show_status(&run_id, full).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Cancel handle tripped by Ctrl-C
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current stage");
            handle.cancel();
        }
    });
    cancel
}

fn run_options(cfg: &ResolvedConfig, rounds: Option<u32>, investment: Option<f64>) -> RunOptions {
    RunOptions {
        n_round: rounds.unwrap_or(cfg.scheduler.n_round),
        investment: investment.or(cfg.scheduler.investment),
    }
}

/// Run a pipeline with the given request
async fn run_pipeline(
    pipeline_name: &str,
    request: Option<String>,
    rounds: Option<u32>,
    investment: Option<f64>,
    no_journal: bool,
) -> Result<()> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(cfg, pipeline_name)?;

    let request = match request {
        Some(request) => request,
        None if !io::stdin().is_terminal() => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read from stdin")?;
            buffer
        }
        None => anyhow::bail!("No request provided. Pass it as an argument or pipe it to stdin"),
    };

    if request.trim().is_empty() {
        anyhow::bail!("Request is empty");
    }

    let mut orchestrator = Orchestrator::from_config(cfg);
    if no_journal {
        orchestrator = orchestrator.without_journal();
    }

    let options = run_options(cfg, rounds, investment);
    let outcome = orchestrator
        .run_pipeline(&pipeline, request.trim().to_string(), &options, &cancel_on_ctrl_c())
        .await?;

    if let Some(artifact) = outcome.last_artifact().filter(|a| a.seq > 0) {
        println!("{}", artifact.content);
    }
    report_outcome(&outcome);

    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn report_outcome(outcome: &RunOutcome) {
    eprintln!("\n[{}]", describe_outcome(outcome));
}

fn describe_outcome(outcome: &RunOutcome) -> String {
    let id = outcome.run_id;
    match &outcome.state {
        RunState::Completed => format!(
            "Run {} completed after {} round(s), {} artifact(s)",
            id,
            outcome.rounds,
            outcome.artifacts.len()
        ),
        RunState::Exhausted {
            reason: ExhaustReason::Rounds { limit },
        } => format!("Run {} stopped: round budget ({}) exhausted", id, limit),
        RunState::Exhausted {
            reason: ExhaustReason::Budget { spent_usd, limit_usd },
        } => format!(
            "Run {} stopped: cost budget exhausted (${:.4} of ${:.4})",
            id, spent_usd, limit_usd
        ),
        RunState::Failed { stage, error, last_index } => format!(
            "Run {} failed in stage '{}': {} (last artifact: {:?})",
            id, stage, error, last_index
        ),
        RunState::Cancelled { last_index } => format!("Run {} cancelled (last artifact: {:?})", id, last_index),
        state => format!("Run {} in state: {:?}", id, state),
    }
}

/// Run a pipeline over a directory
async fn run_batch(
    pipeline_name: &str,
    dir: &Path,
    pattern: &str,
    merge: Option<MergeSpec>,
    rounds: Option<u32>,
    investment: Option<f64>,
) -> Result<()> {
    let cfg = config::config()?;
    let pipeline = load_pipeline(cfg, pipeline_name)?;
    let orchestrator = Orchestrator::from_config(cfg);

    let report = orchestrator
        .run_batch(
            &pipeline,
            dir,
            pattern,
            &run_options(cfg, rounds, investment),
            merge.as_ref(),
            &cancel_on_ctrl_c(),
        )
        .await?;

    println!("{:<60} {:<12} {:<8}", "FILE", "STATE", "ROUNDS");
    println!("{}", "-".repeat(82));
    for (file, outcome) in &report.runs {
        println!("{:<60} {:<12} {:<8}", file.display(), outcome.state.label(), outcome.rounds);
    }

    if let (Some(merged), Some(merge)) = (&report.merged, &merge) {
        eprintln!("\n[Merged {} bytes into {}]", merged.len(), merge.output.display());
    }

    if report.failed().next().is_some() {
        std::process::exit(1);
    }
    Ok(())
}

/// Merge fragment files
async fn merge(dir: &Path, pattern: &str, output: &Path) -> Result<()> {
    let merged = merge_fragments(dir, pattern, output).await?;
    eprintln!("[Merged {} bytes into {}]", merged.len(), output.display());
    Ok(())
}

/// Print every distinct key used under `dir`
async fn keys(dir: &Path, extensions: &[String]) -> Result<()> {
    let keys = scan_keys(dir, extensions).await?;
    for key in &keys {
        println!("{}", key);
    }
    eprintln!("[{} key(s) under {}]", keys.len(), dir.display());
    Ok(())
}

/// Run one normalized command line
async fn exec(command: &str, program: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let program = program.unwrap_or_else(|| cfg.shell.program.clone());

    let shell = ShellCommand::new(program, "command", Duration::from_secs(cfg.shell.timeout_seconds))
        .with_interpreter(cfg.shell.interpreter.clone());
    let output = shell.run(command).await?;

    print!("{}", output);
    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str, full: bool) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let orchestrator = journal_reader()?;
    let run = orchestrator.get_run_status(run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("State: {:?}", run.state);
    println!("Started: {}", run.started_at);
    if let Some(finished) = run.finished_at {
        println!("Finished: {}", finished);
    }
    println!("Rounds: {}", run.rounds);
    println!("\nArtifacts:");
    for artifact in &run.artifacts {
        println!(
            "  #{:<3} {:<20} {:<24} {} bytes",
            artifact.seq,
            artifact.producer.to_string(),
            artifact.kind.as_str(),
            artifact.size_bytes
        );
        if full {
            println!("{}\n", artifact.content);
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let orchestrator = journal_reader()?;
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {:<8}", "RUN ID", "PIPELINE", "STATE", "ROUNDS");
    println!("{}", "-".repeat(80));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<12} {:<8}",
            run.id,
            run.pipeline_name,
            run.state.label(),
            run.rounds
        );
    }

    Ok(())
}

/// Orchestrator reading journals even when new runs are not journaled
fn journal_reader() -> Result<Orchestrator> {
    let cfg = config::config()?;
    Ok(Orchestrator::from_config(cfg).with_journal_dir(config::runs_dir()?))
}

/// Load a pipeline by name
fn load_pipeline(cfg: &ResolvedConfig, name: &str) -> Result<Pipeline> {
    let candidates = [
        cfg.pipelines_dir.join(format!("{}.yaml", name)),
        PathBuf::from(format!("{}.yaml", name)),
        PathBuf::from(name),
    ];

    let path = candidates.iter().find(|p| p.is_file()).with_context(|| {
        let looked: Vec<String> = candidates.iter().map(|p| format!("  - {}", p.display())).collect();
        format!("Pipeline '{}' not found. Looked for:\n{}", name, looked.join("\n"))
    })?;

    let pipeline = Pipeline::from_file(path)?;
    pipeline.validate()?;
    Ok(pipeline)
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("roundtable configuration");
    println!();
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
    println!("  Runs:                {}", cfg.home.join("runs").display());
    println!("  Pipelines:           {}", cfg.pipelines_dir.display());
    println!();
    println!("Completion backend:");
    println!("  Backend:  {:?}", cfg.llm.backend);
    println!("  Endpoint: {}", cfg.llm.endpoint);
    println!("  Model:    {}", cfg.llm.model);
    println!(
        "  API key:  ${} ({})",
        cfg.llm.api_key_env,
        if cfg.llm.api_key().is_some() { "set" } else { "unset" }
    );
    println!("  Price:    ${}/1k tokens", cfg.llm.price_per_1k_tokens);
    println!("  Timeout:  {}s", cfg.llm.timeout_seconds);
    let backend = backend_from_config(cfg);
    match backend.health_check().await {
        Ok(()) => println!("  Health:   ok ({})", backend.name()),
        Err(e) => println!("  Health:   unreachable ({}: {:#})", backend.name(), e),
    }
    println!();
    println!("Shell:");
    println!("  Program:     {}", cfg.shell.program);
    println!("  Interpreter: {}", cfg.shell.interpreter);
    println!("  Timeout:     {}s", cfg.shell.timeout_seconds);
    println!();
    println!("Scheduler:");
    println!("  Rounds:     {}", cfg.scheduler.n_round);
    match cfg.scheduler.investment {
        Some(investment) => println!("  Investment: ${}", investment),
        None => println!("  Investment: (pipeline limit)"),
    }
    println!("  Journal:    {}", cfg.scheduler.journal);

    Ok(())
}
