//! roundtable - Round-based pipeline orchestrator
//!
//! A set of named stages cooperate through a shared, append-only artifact
//! log. Each stage declares which artifact kinds wake it up, which part of
//! the log it reads, one operation (file read, file write, shell command
//! or generative completion) and the kind of artifact it produces.
//!
//! # Architecture
//!
//! - A run is seeded with a request artifact
//! - Each round, stages triggered by artifacts from the previous round
//!   activate in hiring order and append their outputs
//! - The run ends when a round triggers nothing, or when the round or
//!   cost budget runs out
//!
//! # Modules
//!
//! - `adapters`: Operations (file, shell, completion) and text helpers
//! - `core`: Artifact log, stages, scheduler, pipelines, journal
//! - `domain`: Data structures (Artifact, RunState, JournalEntry)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Translate one file
//! roundtable run translate ./locales/en/home.json
//!
//! # Translate a directory and merge the fragments
//! roundtable batch translate ./locales/en --pattern '*.json' \
//!     --merge-pattern '*-fanyi.json' --merge-into ./zh.json
//!
//! # Check run status
//! roundtable status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Operation, OperationError, OperationInput};
pub use core::{CancelHandle, Orchestrator, Pipeline, RunOptions, RunOutcome, Scheduler, Stage, StageError};
pub use domain::{Artifact, ArtifactKind, RunState};
