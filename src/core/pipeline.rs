//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML as an ordered list of stages (the hiring
//! order). Each stage names its trigger kinds, its context slots, one
//! operation and the kind of artifact it produces.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::limits::RunLimits;
use super::stage::{Binding, Stage, DEFAULT_SLOT};
use crate::adapters::{
    Cleanup, Completion, CompletionBackend, Operation, PromptTemplate, ReadFile, ShellCommand, WriteFile, WriteMode,
    WriteTarget,
};
use crate::domain::ArtifactKind;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Limits applied to every run of this pipeline
    #[serde(default)]
    pub limits: RunLimits,

    /// Stages in hiring order
    pub stages: Vec<StageSpec>,
}

/// One stage as declared in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// Kinds that activate the stage; empty means never
    #[serde(default)]
    pub triggers: Vec<ArtifactKind>,

    /// Named context slots, each bound to one rule
    #[serde(default)]
    pub context: Vec<Binding>,

    pub operation: OperationSpec,

    /// Kind stamped on the stage's output
    pub output_kind: ArtifactKind,
}

fn default_slot() -> String {
    DEFAULT_SLOT.to_string()
}

/// Operation invoked by a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OperationSpec {
    /// Read the file named by a slot
    ReadFile {
        #[serde(default = "default_slot")]
        path_slot: String,
    },

    /// Write a slot's text to a fixed path or to a path taken from a slot
    WriteFile {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        path_slot: Option<String>,
        #[serde(default)]
        suffix: String,
        #[serde(default = "default_slot")]
        content_slot: String,
        #[serde(default)]
        mode: WriteMode,
        #[serde(default)]
        cleanup: Option<Cleanup>,
    },

    /// Run a command line, prefixed with the required program
    Shell {
        /// Overrides the configured program
        #[serde(default)]
        program: Option<String>,
        #[serde(default = "default_slot")]
        command_slot: String,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },

    /// Render a prompt and ask the completion backend
    Completion {
        template: String,
        #[serde(default)]
        fence: Option<String>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
}

/// Collaborators needed to turn specs into operations
#[derive(Clone)]
pub struct Toolbox {
    /// Backend for every completion stage
    pub backend: Arc<dyn CompletionBackend>,

    /// Program every shell command line is prefixed with
    pub shell_program: String,

    /// Interpreter running shell command lines (`<interpreter> -c <line>`)
    pub shell_interpreter: String,

    /// Shell timeout for pipelines that set no step timeout
    pub shell_timeout: Option<Duration>,

    /// Completion timeout for pipelines that set no step timeout
    pub completion_timeout: Option<Duration>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.stages.is_empty() {
            anyhow::bail!("Pipeline must have at least one stage");
        }

        let mut names = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                anyhow::bail!("Stage {} has an empty name", i);
            }
            if !names.insert(stage.name.as_str()) {
                anyhow::bail!("Stage '{}' is declared more than once", stage.name);
            }
            if stage.output_kind.as_str().is_empty() {
                anyhow::bail!("Stage '{}' has an empty output kind", stage.name);
            }

            if let OperationSpec::WriteFile { path, path_slot, .. } = &stage.operation {
                match (path, path_slot) {
                    (Some(_), Some(_)) => {
                        anyhow::bail!("Stage '{}' sets both path and path_slot", stage.name)
                    }
                    (None, None) => {
                        anyhow::bail!("Stage '{}' needs a path or a path_slot", stage.name)
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Build the stages, in hiring order
    ///
    /// Wiring errors (unbound or duplicate slots) are reported here rather
    /// than in the middle of a run.
    pub fn build(&self, toolbox: &Toolbox) -> Result<Vec<Stage>> {
        self.validate()?;

        self.stages
            .iter()
            .map(|spec| {
                let stage = spec.build(&self.limits, toolbox);
                stage
                    .validate()
                    .with_context(|| format!("Invalid wiring in pipeline '{}'", self.name))?;
                Ok(stage)
            })
            .collect()
    }
}

impl StageSpec {
    fn build(&self, limits: &RunLimits, toolbox: &Toolbox) -> Stage {
        let operation = self.operation.build(limits, toolbox);

        let stage = self
            .triggers
            .iter()
            .fold(Stage::new(self.name.clone(), operation, self.output_kind.clone()), |stage, kind| {
                stage.triggered_by(kind.clone())
            });

        self.context
            .iter()
            .fold(stage, |stage, binding| stage.bind(binding.slot.clone(), binding.rule.clone()))
    }
}

impl OperationSpec {
    fn build(&self, limits: &RunLimits, toolbox: &Toolbox) -> Arc<dyn Operation> {
        let timeout = |seconds: Option<u64>, default: Option<Duration>| {
            seconds
                .or(limits.step_timeout_seconds)
                .map(Duration::from_secs)
                .or(default)
                .unwrap_or_else(|| limits.step_timeout())
        };

        match self {
            Self::ReadFile { path_slot } => Arc::new(ReadFile::new(path_slot.clone(), limits.clone())),

            Self::WriteFile {
                path,
                path_slot,
                suffix,
                content_slot,
                mode,
                cleanup,
            } => {
                let target = match (path, path_slot) {
                    (Some(path), _) => WriteTarget::Fixed(path.clone()),
                    (None, slot) => WriteTarget::FromSlot {
                        slot: slot.clone().unwrap_or_else(default_slot),
                        suffix: suffix.clone(),
                    },
                };

                let write = WriteFile::new(target, content_slot.clone(), *mode, limits.clone());
                match cleanup {
                    Some(cleanup) => Arc::new(write.with_cleanup(*cleanup)),
                    None => Arc::new(write),
                }
            }

            Self::Shell {
                program,
                command_slot,
                timeout_seconds,
            } => {
                let program = program.clone().unwrap_or_else(|| toolbox.shell_program.clone());
                Arc::new(
                    ShellCommand::new(program, command_slot.clone(), timeout(*timeout_seconds, toolbox.shell_timeout))
                        .with_interpreter(toolbox.shell_interpreter.clone()),
                )
            }

            Self::Completion {
                template,
                fence,
                timeout_seconds,
            } => {
                let completion = Completion::new(
                    PromptTemplate::new(template),
                    toolbox.backend.clone(),
                    timeout(*timeout_seconds, toolbox.completion_timeout),
                );
                match fence {
                    Some(tag) => Arc::new(completion.with_fence(tag.clone())),
                    None => Arc::new(completion),
                }
            }
        }
    }
}
