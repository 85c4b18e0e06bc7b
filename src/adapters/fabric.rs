//! Fabric completion backend.
//!
//! Subprocess mode: the rendered prompt is piped to the `fabric` CLI on
//! stdin and the answer collected from stdout.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::completion::CompletionBackend;
use super::{AdapterOutput, OperationError};

/// Fabric backend using subprocess mode
pub struct FabricBackend {
    /// Path to the fabric binary (default: "fabric")
    binary_path: String,

    /// Pattern applied to every prompt; raw prompt if unset
    pattern: Option<String>,
}

impl Default for FabricBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricBackend {
    /// Create a new Fabric backend with default binary path
    ///
    /// Looks for fabric-ai first (Homebrew install), falls back to fabric
    pub fn new() -> Self {
        let binary_path = if std::process::Command::new("fabric-ai")
            .arg("--help")
            .output()
            .is_ok()
        {
            "fabric-ai".to_string()
        } else {
            "fabric".to_string()
        };

        Self {
            binary_path,
            pattern: None,
        }
    }

    /// Create a Fabric backend with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    async fn execute_subprocess(&self, prompt: &str, step_timeout: Duration) -> Result<String, OperationError> {
        let mut command = Command::new(&self.binary_path);
        if let Some(ref pattern) = self.pattern {
            command.args(["-p", pattern]);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OperationError::Failed(format!("Failed to spawn {}: {}", self.binary_path, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| OperationError::Failed(format!("Failed to write to fabric stdin: {}", e)))?;
            // Drop stdin to signal EOF
        }

        let output = timeout(step_timeout, child.wait_with_output())
            .await
            .map_err(|_| OperationError::Timeout {
                operation: "fabric completion".to_string(),
                after: step_timeout,
            })?
            .map_err(|e| OperationError::Failed(format!("Failed to wait for fabric: {}", e)))?;

        if !output.status.success() {
            return Err(OperationError::Command {
                command: self.binary_path.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|_| OperationError::Failed("Fabric output is not valid UTF-8".to_string()))
    }
}

#[async_trait]
impl CompletionBackend for FabricBackend {
    fn name(&self) -> &str {
        "fabric"
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<AdapterOutput, OperationError> {
        let content = self.execute_subprocess(prompt, timeout).await?;
        Ok(AdapterOutput::new(content))
    }

    async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.binary_path)
            .arg("-l")
            .output()
            .await
            .context("Failed to run fabric health check")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Fabric health check failed: {}", stderr);
        }

        Ok(())
    }
}
