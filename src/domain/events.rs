//! Journal entries recorded for a run.
//!
//! The journal is a diagnostic mirror of the in-memory artifact log: one
//! entry per append, plus run and round boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::Artifact;
use super::run::RunState;

/// A single line of a run journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique identifier for this entry
    pub id: Uuid,

    /// When this entry was written (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this entry belongs to
    pub run_id: Uuid,

    /// Type of entry
    pub kind: EntryKind,

    /// Human-readable summary (never the artifact payload)
    pub summary: String,

    /// Round number, for round-scoped entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,

    /// Appended artifact, for `ArtifactAppended`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    /// Content digest of the appended artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Terminal state, for `RunFinished`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,
}

impl JournalEntry {
    /// Create a new entry with the current timestamp
    pub fn new(run_id: Uuid, kind: EntryKind, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            kind,
            summary: summary.into(),
            round: None,
            artifact: None,
            digest: None,
            state: None,
        }
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact, digest: String) -> Self {
        self.artifact = Some(artifact);
        self.digest = Some(digest);
        self
    }

    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Types of journal entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A run was started; summary carries the pipeline name
    RunStarted,

    /// An artifact was appended to the log
    ArtifactAppended,

    /// A round finished
    RoundCompleted,

    /// The run reached a terminal state
    RunFinished,
}
