//! Run state and reconstruction from journal entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::Artifact;
use super::events::{EntryKind, JournalEntry};

/// State of a pipeline run
///
/// `Idle -> Running -> (Completed | Exhausted | Failed | Cancelled)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// No round has started yet
    Idle,

    /// Executing the given round (1-indexed)
    Running { round: u32 },

    /// A round triggered no stage
    Completed,

    /// The run stopped on a budget before going idle
    Exhausted { reason: ExhaustReason },

    /// A stage failed; the log keeps everything appended before the failure
    Failed {
        stage: String,
        error: String,
        last_index: Option<u64>,
    },

    /// The run driver cancelled between stage activations
    Cancelled { last_index: Option<u64> },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RunState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Running { .. })
    }

    /// Short lowercase label for listings
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running { .. } => "running",
            Self::Completed => "completed",
            Self::Exhausted { .. } => "exhausted",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Which budget ended an exhausted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "budget")]
pub enum ExhaustReason {
    /// `n_round` rounds ran and stages were still triggered
    Rounds { limit: u32 },

    /// Accumulated operation cost reached the investment
    Budget { spent_usd: f64, limit_usd: f64 },
}

/// A run as reconstructed from its journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,

    /// Name of the pipeline that was run
    pub pipeline_name: String,

    pub state: RunState,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Rounds completed so far
    pub rounds: u32,

    /// Artifact log in append order
    pub artifacts: Vec<Artifact>,
}

impl RunSummary {
    /// Reconstruct a run from its journal entries
    pub fn from_entries(entries: &[JournalEntry]) -> Option<Self> {
        let first = entries.first()?;

        let mut summary = Self {
            id: first.run_id,
            pipeline_name: String::new(),
            state: RunState::Idle,
            started_at: first.timestamp,
            finished_at: None,
            rounds: 0,
            artifacts: Vec::new(),
        };

        for entry in entries {
            summary.apply_entry(entry);
        }

        Some(summary)
    }

    /// Apply a single entry
    pub fn apply_entry(&mut self, entry: &JournalEntry) {
        match entry.kind {
            EntryKind::RunStarted => {
                self.pipeline_name = entry.summary.clone();
                self.started_at = entry.timestamp;
            }
            EntryKind::ArtifactAppended => {
                if let Some(ref artifact) = entry.artifact {
                    self.artifacts.push(artifact.clone());
                }
                if let Some(round) = entry.round.filter(|r| *r > 0) {
                    self.state = RunState::Running { round };
                }
            }
            EntryKind::RoundCompleted => {
                if let Some(round) = entry.round {
                    self.rounds = self.rounds.max(round);
                }
            }
            EntryKind::RunFinished => {
                if let Some(ref state) = entry.state {
                    self.state = state.clone();
                }
                self.finished_at = Some(entry.timestamp);
            }
        }
    }

    /// The last artifact of the run, usually its result
    pub fn last_artifact(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }
}
