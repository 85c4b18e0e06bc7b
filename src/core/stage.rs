//! Stages: named units that react to artifact kinds.
//!
//! A stage declares which kinds trigger it, which prior artifacts it reads
//! (one context rule per named slot), the operation it invokes and the
//! kind it stamps on its output. Stages never append to the log; they hand
//! a draft back to the scheduler.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::log::ArtifactLog;
use crate::adapters::{Operation, OperationError, OperationInput, Slot};
use crate::domain::{Artifact, ArtifactDraft, ArtifactKind, Producer};

/// Slot used when a stage binds a single context rule
pub const DEFAULT_SLOT: &str = "input";

/// Policy selecting which prior artifacts a stage consumes
///
/// An empty `kinds` list matches every kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum ContextRule {
    /// The most recent artifact of a matching kind
    MostRecent {
        #[serde(default)]
        kinds: Vec<ArtifactKind>,
    },

    /// The artifact at an absolute log position (0 is the seed)
    FixedIndex { index: usize },

    /// Every matching artifact appended after this stage's last output
    SinceLastOwnOutput {
        #[serde(default)]
        kinds: Vec<ArtifactKind>,
    },
}

impl ContextRule {
    /// Most recent artifact of any kind
    pub fn most_recent() -> Self {
        Self::MostRecent { kinds: Vec::new() }
    }

    pub fn most_recent_of<K: Into<ArtifactKind>>(kinds: impl IntoIterator<Item = K>) -> Self {
        Self::MostRecent {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fixed_index(index: usize) -> Self {
        Self::FixedIndex { index }
    }

    /// The seed artifact
    pub fn seed() -> Self {
        Self::fixed_index(0)
    }

    pub fn since_last_own_output<K: Into<ArtifactKind>>(kinds: impl IntoIterator<Item = K>) -> Self {
        Self::SinceLastOwnOutput {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(kinds: &[ArtifactKind], artifact: &Artifact) -> bool {
        kinds.is_empty() || kinds.contains(&artifact.kind)
    }

    /// Apply the rule for `stage`; the error is a human-readable reason
    pub fn select(&self, log: &ArtifactLog, stage: &str) -> Result<Vec<Artifact>, String> {
        match self {
            Self::MostRecent { kinds } => log
                .iter()
                .rev()
                .find(|a| Self::matches(kinds, a))
                .map(|a| vec![a.clone()])
                .ok_or_else(|| format!("no artifact of kind {} in the log", describe(kinds))),

            Self::FixedIndex { index } => log
                .get(*index)
                .map(|a| vec![a.clone()])
                .ok_or_else(|| format!("index {} is beyond log length {}", index, log.len())),

            Self::SinceLastOwnOutput { kinds } => {
                let start = log
                    .iter()
                    .rev()
                    .find(|a| a.producer.is_stage(stage))
                    .map(|a| a.seq as usize + 1)
                    .unwrap_or(0);

                let selected: Vec<Artifact> = log
                    .since(start)
                    .iter()
                    .filter(|a| Self::matches(kinds, a))
                    .cloned()
                    .collect();

                if selected.is_empty() {
                    Err(format!(
                        "no artifact of kind {} since index {}",
                        describe(kinds),
                        start
                    ))
                } else {
                    Ok(selected)
                }
            }
        }
    }
}

fn describe(kinds: &[ArtifactKind]) -> String {
    if kinds.is_empty() {
        return "any".to_string();
    }
    kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join("|")
}

/// A context rule bound to a named slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub slot: String,
    #[serde(flatten)]
    pub rule: ContextRule,
}

/// Errors raised by stages, at hiring time or while activating
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage '{stage}' failed: {source}")]
    Operation {
        stage: String,
        #[source]
        source: OperationError,
    },

    #[error("Stage '{stage}' context unavailable: {reason}")]
    ContextUnavailable { stage: String, reason: String },

    #[error("Stage '{stage}' is already hired")]
    DuplicateStage { stage: String },

    #[error("Stage '{stage}' binds slot '{slot}' more than once")]
    DuplicateSlot { stage: String, slot: String },

    #[error("Stage '{stage}' needs slot '{slot}' but does not bind it")]
    UnboundSlot { stage: String, slot: String },

    #[error("Stages cannot be hired after the run started")]
    AlreadyStarted,
}

/// Result of one activation, before the scheduler appends it
#[derive(Debug, Clone)]
pub struct Activation {
    pub draft: ArtifactDraft,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
}

/// A hired processing unit
#[derive(Clone)]
pub struct Stage {
    name: String,
    triggers: BTreeSet<ArtifactKind>,
    bindings: Vec<Binding>,
    operation: Arc<dyn Operation>,
    output_kind: ArtifactKind,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("bindings", &self.bindings)
            .field("operation", &self.operation.name())
            .field("output_kind", &self.output_kind)
            .finish()
    }
}

impl Stage {
    /// A stage with no triggers and no context yet
    pub fn new(
        name: impl Into<String>,
        operation: Arc<dyn Operation>,
        output_kind: impl Into<ArtifactKind>,
    ) -> Self {
        Self {
            name: name.into(),
            triggers: BTreeSet::new(),
            bindings: Vec::new(),
            operation,
            output_kind: output_kind.into(),
        }
    }

    pub fn triggered_by(mut self, kind: impl Into<ArtifactKind>) -> Self {
        self.triggers.insert(kind.into());
        self
    }

    /// Bind `rule` to the default slot
    pub fn context(self, rule: ContextRule) -> Self {
        self.bind(DEFAULT_SLOT, rule)
    }

    pub fn bind(mut self, slot: impl Into<String>, rule: ContextRule) -> Self {
        self.bindings.push(Binding {
            slot: slot.into(),
            rule,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triggers(&self) -> &BTreeSet<ArtifactKind> {
        &self.triggers
    }

    pub fn output_kind(&self) -> &ArtifactKind {
        &self.output_kind
    }

    /// Check that every slot the operation reads is bound exactly once
    pub fn validate(&self) -> Result<(), StageError> {
        let mut seen = BTreeSet::new();
        for binding in &self.bindings {
            if !seen.insert(binding.slot.as_str()) {
                return Err(StageError::DuplicateSlot {
                    stage: self.name.clone(),
                    slot: binding.slot.clone(),
                });
            }
        }

        for slot in self.operation.required_slots() {
            if !seen.contains(slot.as_str()) {
                return Err(StageError::UnboundSlot {
                    stage: self.name.clone(),
                    slot,
                });
            }
        }
        Ok(())
    }

    /// True iff an artifact at or after `since` has a trigger kind
    pub fn is_triggered(&self, log: &ArtifactLog, since: usize) -> bool {
        !self.triggers.is_empty() && log.since(since).iter().any(|a| self.triggers.contains(&a.kind))
    }

    /// Apply every binding's rule to the log
    pub fn select_context(&self, log: &ArtifactLog) -> Result<OperationInput, StageError> {
        let slots = self
            .bindings
            .iter()
            .map(|binding| {
                binding
                    .rule
                    .select(log, &self.name)
                    .map(|artifacts| Slot {
                        name: binding.slot.clone(),
                        artifacts,
                    })
                    .map_err(|reason| StageError::ContextUnavailable {
                        stage: self.name.clone(),
                        reason: format!("slot '{}': {}", binding.slot, reason),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(OperationInput::new(slots))
    }

    /// Select context, invoke the operation and stamp the result
    pub async fn activate(&self, log: &ArtifactLog) -> Result<Activation, StageError> {
        let input = self.select_context(log)?;

        let output = self
            .operation
            .invoke(&input)
            .await
            .map_err(|source| StageError::Operation {
                stage: self.name.clone(),
                source,
            })?;

        Ok(Activation {
            draft: ArtifactDraft::new(
                Producer::stage(self.name.clone()),
                self.output_kind.clone(),
                output.content,
            ),
            tokens_used: output.tokens_used,
            cost_usd: output.cost_usd,
        })
    }
}
