//! External operation adapters.
//!
//! Every transformation a stage delegates (file I/O, shell commands,
//! generative completions) sits behind the [`Operation`] trait. The core
//! treats each one as an opaque, possibly slow, possibly failing call.

pub mod completion;
pub mod fabric;
pub mod file;
pub mod keys;
pub mod llm;
pub mod merge;
pub mod shell;
pub mod text;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::limits::LimitViolation;
use crate::domain::Artifact;

pub use completion::{Completion, CompletionBackend, PromptTemplate};
pub use fabric::FabricBackend;
pub use file::{Cleanup, ReadFile, WriteFile, WriteMode, WriteTarget};
pub use keys::scan_keys;
pub use llm::HttpBackend;
pub use merge::merge_fragments;
pub use shell::{normalize_command, ShellCommand};
pub use text::{clean_json_fragment, extract_fenced};

/// Output from an operation
#[derive(Debug, Clone)]
pub struct AdapterOutput {
    /// The textual result
    pub content: String,

    /// Tokens used (if available)
    pub tokens_used: Option<u64>,

    /// Cost in USD (if available)
    pub cost_usd: Option<f64>,
}

impl AdapterOutput {
    /// Create a new adapter output with just content
    pub fn new(content: String) -> Self {
        Self {
            content,
            tokens_used: None,
            cost_usd: None,
        }
    }
}

/// One named group of context artifacts
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub artifacts: Vec<Artifact>,
}

/// Structured input handed to an operation: the stage's selected context
#[derive(Debug, Clone, Default)]
pub struct OperationInput {
    slots: Vec<Slot>,
}

impl OperationInput {
    pub fn new(slots: Vec<Slot>) -> Self {
        Self { slots }
    }

    /// Input with a single slot
    pub fn single(name: impl Into<String>, artifacts: Vec<Artifact>) -> Self {
        Self::new(vec![Slot {
            name: name.into(),
            artifacts,
        }])
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Contents of a slot, joined by newlines
    pub fn text(&self, name: &str) -> Result<String, OperationError> {
        let slot = self.slot(name).ok_or_else(|| OperationError::MissingInput {
            slot: name.to_string(),
        })?;

        Ok(slot
            .artifacts
            .iter()
            .map(|a| a.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// All artifacts in slot order
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.slots.iter().flat_map(|s| s.artifacts.iter())
    }
}

/// Failures surfaced by operations
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` exited with code {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Input slot '{slot}' is not bound")]
    MissingInput { slot: String },

    #[error(transparent)]
    Limit(#[from] LimitViolation),

    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A black-box transformation invoked by a stage
#[async_trait]
pub trait Operation: Send + Sync {
    /// Human-readable operation name
    fn name(&self) -> &str;

    /// Context slots this operation reads; checked when a stage is hired
    fn required_slots(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the operation on the selected context
    async fn invoke(&self, input: &OperationInput) -> Result<AdapterOutput, OperationError>;
}
