//! Domain types for the roundtable orchestrator.
//!
//! This module contains the core data structures:
//! - Artifact: immutable log records
//! - JournalEntry: persisted mirror of a run
//! - RunState: scheduler state machine

pub mod artifact;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactDraft, ArtifactKind, Producer};
pub use events::{EntryKind, JournalEntry};
pub use run::{ExhaustReason, RunState, RunSummary};
