//! Run driver.
//!
//! Builds a fresh scheduler per run, seeds it with the request, runs it
//! for a bounded number of rounds and hands back the terminal state and
//! the artifact log. Also runs a pipeline over a directory of files and
//! reads past runs back from their journals.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::cancel::CancelHandle;
use super::journal::Journal;
use super::pipeline::{Pipeline, Toolbox};
use super::scheduler::{RunOutcome, Scheduler};
use crate::adapters::merge::collect_sorted;
use crate::adapters::{merge_fragments, CompletionBackend, FabricBackend, HttpBackend};
use crate::config::{LlmBackend, ResolvedConfig};
use crate::domain::RunSummary;

/// Per-run knobs given by the caller
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of rounds
    pub n_round: u32,

    /// Cost budget in USD; the pipeline's `max_cost_usd` when unset
    pub investment: Option<f64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            n_round: 3,
            investment: None,
        }
    }
}

/// Merge step run after a batch
#[derive(Debug, Clone)]
pub struct MergeSpec {
    /// Glob pattern of the fragments, relative to the batch directory
    pub pattern: String,

    /// File receiving the merged table
    pub output: PathBuf,
}

/// Result of running a pipeline over a directory
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One outcome per input file, in file-name order
    pub runs: Vec<(PathBuf, RunOutcome)>,

    /// The merged table, if a merge was requested
    pub merged: Option<String>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &(PathBuf, RunOutcome)> {
        self.runs.iter().filter(|(_, outcome)| !outcome.is_success())
    }
}

/// Main run driver
pub struct Orchestrator {
    toolbox: Toolbox,

    /// Where journals go; `None` disables journaling
    runs_dir: Option<PathBuf>,
}

impl Orchestrator {
    /// Create an orchestrator without journaling
    pub fn new(toolbox: Toolbox) -> Self {
        Self {
            toolbox,
            runs_dir: None,
        }
    }

    /// Create an orchestrator from resolved configuration
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let toolbox = Toolbox {
            backend: backend_from_config(config),
            shell_program: config.shell.program.clone(),
            shell_interpreter: config.shell.interpreter.clone(),
            shell_timeout: Some(Duration::from_secs(config.shell.timeout_seconds)),
            completion_timeout: Some(Duration::from_secs(config.llm.timeout_seconds)),
        };

        let orchestrator = Self::new(toolbox);
        if config.scheduler.journal {
            orchestrator.with_journal_dir(config.home.join("runs"))
        } else {
            orchestrator
        }
    }

    /// Persist every run under `runs_dir`
    pub fn with_journal_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Stop persisting runs
    pub fn without_journal(mut self) -> Self {
        self.runs_dir = None;
        self
    }

    pub fn runs_dir(&self) -> Option<&Path> {
        self.runs_dir.as_deref()
    }

    /// Execute a pipeline for one request
    ///
    /// Only definition and wiring errors are returned as `Err`; a stage
    /// failure is a `Failed` outcome.
    #[instrument(skip(self, pipeline, request, cancel), fields(pipeline = %pipeline.name))]
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        request: impl Into<String>,
        options: &RunOptions,
        cancel: &CancelHandle,
    ) -> Result<RunOutcome> {
        let stages = pipeline.build(&self.toolbox)?;

        let mut limits = pipeline.limits.clone();
        if let Some(investment) = options.investment {
            limits.max_cost_usd = investment;
        }

        let mut scheduler = Scheduler::new(pipeline.name.clone(), limits);
        if let Some(ref runs_dir) = self.runs_dir {
            match Journal::open(runs_dir, Uuid::new_v4()).await {
                Ok(journal) => scheduler = scheduler.with_journal(journal),
                Err(e) => warn!(error = %e, "Journal unavailable, running without it"),
            }
        }

        scheduler
            .hire_all(stages)
            .with_context(|| format!("Failed to hire stages of pipeline '{}'", pipeline.name))?;

        info!(run_id = %scheduler.run_id(), n_round = options.n_round, "Starting pipeline run");
        scheduler.seed(request).await;

        Ok(scheduler.run(options.n_round, cancel).await)
    }

    /// Run `pipeline` once per file in `dir` matching `pattern`
    ///
    /// Each file gets an independent run, with its path as the request.
    /// Failed runs are reported and the batch moves on; cancellation stops
    /// the batch after the current run.
    #[instrument(skip(self, pipeline, options, merge, cancel), fields(pipeline = %pipeline.name, dir = %dir.display()))]
    pub async fn run_batch(
        &self,
        pipeline: &Pipeline,
        dir: &Path,
        pattern: &str,
        options: &RunOptions,
        merge: Option<&MergeSpec>,
        cancel: &CancelHandle,
    ) -> Result<BatchReport> {
        let files = collect_sorted(dir, pattern)?;
        info!(files = files.len(), "Starting batch");

        let mut report = BatchReport::default();
        for file in files {
            if cancel.is_cancelled() {
                warn!("Batch cancelled");
                break;
            }

            let outcome = self
                .run_pipeline(pipeline, file.display().to_string(), options, cancel)
                .await?;

            if !outcome.is_success() {
                error!(file = %file.display(), state = outcome.state.label(), "Batch item did not succeed");
            }
            report.runs.push((file, outcome));
        }

        if let Some(merge) = merge {
            if !cancel.is_cancelled() {
                report.merged = Some(merge_fragments(dir, &merge.pattern, &merge.output).await?);
            }
        }

        Ok(report)
    }

    /// Reconstruct a past run from its journal
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<RunSummary> {
        let runs_dir = self.journal_dir()?;
        let journal = Journal::locate(runs_dir, run_id)?;
        let entries = journal.replay().await?;

        RunSummary::from_entries(&entries).with_context(|| format!("Run {} not found", run_id))
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let runs_dir = self.journal_dir()?;
        let mut runs = Vec::new();

        for run_id in Journal::list_runs(runs_dir).await? {
            if let Ok(run) = self.get_run_status(run_id).await {
                runs.push(run);
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn journal_dir(&self) -> Result<&Path> {
        self.runs_dir
            .as_deref()
            .context("Journaling is disabled; no runs are recorded")
    }
}

/// Completion backend selected by the configuration
pub fn backend_from_config(config: &ResolvedConfig) -> Arc<dyn CompletionBackend> {
    let llm = &config.llm;
    match llm.backend {
        LlmBackend::Http => {
            let backend = HttpBackend::new(llm.endpoint.clone(), llm.model.clone()).with_price(llm.price_per_1k_tokens);
            match llm.api_key() {
                Some(key) => Arc::new(backend.with_api_key(key)),
                None => Arc::new(backend),
            }
        }
        LlmBackend::Fabric => {
            let backend = match llm.fabric_binary {
                Some(ref binary) => FabricBackend::with_binary_path(binary.clone()),
                None => FabricBackend::new(),
            };
            match llm.fabric_pattern {
                Some(ref pattern) => Arc::new(backend.with_pattern(pattern.clone())),
                None => Arc::new(backend),
            }
        }
    }
}
