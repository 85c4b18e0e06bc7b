//! Core orchestration logic.
//!
//! This module contains:
//! - ArtifactLog: the append-only, ordered log of a run
//! - Stage: trigger sets, context rules and activation
//! - Scheduler: round-based execution and termination
//! - Orchestrator: the run driver (single runs, batches, journals)
//! - Pipeline: YAML pipeline definitions
//! - Journal: JSONL persistence of runs
//! - Limits: cost budget, size limits and denylist

pub mod cancel;
pub mod journal;
pub mod limits;
pub mod log;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod stage;

// Re-export commonly used types
pub use cancel::CancelHandle;
pub use journal::{hash_content, Journal};
pub use limits::{LimitViolation, RunLimits, RunTracker};
pub use log::ArtifactLog;
pub use orchestrator::{backend_from_config, BatchReport, MergeSpec, Orchestrator, RunOptions};
pub use pipeline::{OperationSpec, Pipeline, StageSpec, Toolbox};
pub use scheduler::{RunOutcome, Scheduler};
pub use stage::{Activation, Binding, ContextRule, Stage, StageError};
