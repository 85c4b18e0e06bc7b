//! File read and write operations.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::text::clean_json_fragment;
use super::{AdapterOutput, Operation, OperationError, OperationInput};
use crate::core::limits::RunLimits;

/// Reads the file whose path is the text of a context slot
pub struct ReadFile {
    path_slot: String,
    limits: RunLimits,
}

impl ReadFile {
    pub fn new(path_slot: impl Into<String>, limits: RunLimits) -> Self {
        Self {
            path_slot: path_slot.into(),
            limits,
        }
    }
}

#[async_trait]
impl Operation for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn required_slots(&self) -> Vec<String> {
        vec![self.path_slot.clone()]
    }

    async fn invoke(&self, input: &OperationInput) -> Result<AdapterOutput, OperationError> {
        let path = PathBuf::from(input.text(&self.path_slot)?.trim());
        self.limits.validate_path(&path)?;

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| OperationError::io(&path, e))?;
        self.limits.validate_input(&content)?;

        debug!(path = %path.display(), bytes = content.len(), "Read file");
        Ok(AdapterOutput::new(content))
    }
}

/// How a write treats an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

/// Where a write lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTarget {
    /// A fixed path
    Fixed(PathBuf),

    /// The text of a context slot, with a suffix appended
    FromSlot { slot: String, suffix: String },
}

/// Text transformations applied before writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cleanup {
    /// See [`clean_json_fragment`]
    JsonFragment,
}

/// Writes the text of a context slot to a file and returns what was written
pub struct WriteFile {
    target: WriteTarget,
    content_slot: String,
    mode: WriteMode,
    cleanup: Option<Cleanup>,
    limits: RunLimits,
}

impl WriteFile {
    pub fn new(target: WriteTarget, content_slot: impl Into<String>, mode: WriteMode, limits: RunLimits) -> Self {
        Self {
            target,
            content_slot: content_slot.into(),
            mode,
            cleanup: None,
            limits,
        }
    }

    pub fn with_cleanup(mut self, cleanup: Cleanup) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    fn resolve_path(&self, input: &OperationInput) -> Result<PathBuf, OperationError> {
        match &self.target {
            WriteTarget::Fixed(path) => Ok(path.clone()),
            WriteTarget::FromSlot { slot, suffix } => {
                let base = input.text(slot)?;
                Ok(PathBuf::from(format!("{}{}", base.trim(), suffix)))
            }
        }
    }
}

#[async_trait]
impl Operation for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn required_slots(&self) -> Vec<String> {
        let mut slots = vec![self.content_slot.clone()];
        if let WriteTarget::FromSlot { slot, .. } = &self.target {
            slots.push(slot.clone());
        }
        slots
    }

    async fn invoke(&self, input: &OperationInput) -> Result<AdapterOutput, OperationError> {
        let path = self.resolve_path(input)?;
        self.limits.validate_path(&path)?;

        let mut content = input.text(&self.content_slot)?;
        if let Some(Cleanup::JsonFragment) = self.cleanup {
            content = clean_json_fragment(&content);
        }

        let mut options = OpenOptions::new();
        options.create(true);
        match self.mode {
            WriteMode::Overwrite => options.write(true).truncate(true),
            WriteMode::Append => options.append(true),
        };

        let mut file = options
            .open(&path)
            .await
            .map_err(|e| OperationError::io(&path, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| OperationError::io(&path, e))?;
        file.flush().await.map_err(|e| OperationError::io(&path, e))?;

        debug!(path = %path.display(), mode = ?self.mode, bytes = content.len(), "Wrote file");
        Ok(AdapterOutput::new(content))
    }
}
