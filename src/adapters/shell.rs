//! Shell command operation.
//!
//! The command line is normalized so it starts with a required program
//! exactly once, then executed through an interpreter (`sh -c`). This is a
//! precondition check, not a sandbox.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{AdapterOutput, Operation, OperationError, OperationInput};

/// Ensure `line` starts with `program` exactly once and collapse whitespace.
///
/// `"get pods -A"` with `"kubectl"` becomes `"kubectl get pods -A"`;
/// `"kubectl   get   pods"` becomes `"kubectl get pods"`.
pub fn normalize_command(line: &str, program: &str) -> String {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if program.is_empty() {
        return tokens.join(" ");
    }

    let leading = tokens.iter().take_while(|t| **t == program).count();

    std::iter::once(program)
        .chain(tokens[leading..].iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs a command line taken from a context slot and captures stdout
pub struct ShellCommand {
    /// Program every command line must start with
    program: String,

    /// Interpreter invoked as `<interpreter> -c <line>`
    interpreter: String,

    command_slot: String,

    timeout: Duration,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>, command_slot: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            interpreter: "sh".to_string(),
            command_slot: command_slot.into(),
            timeout,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Normalize and execute a command line
    pub async fn run(&self, line: &str) -> Result<String, OperationError> {
        let command = normalize_command(line, &self.program);
        debug!(%command, "Executing shell command");

        let child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OperationError::Failed(format!("Failed to spawn `{}`: {}", command, e)))?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OperationError::Timeout {
                operation: format!("`{}`", command),
                after: self.timeout,
            })?
            .map_err(|e| OperationError::Failed(format!("Failed to wait for `{}`: {}", command, e)))?;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(%command, exit_code, "Shell command failed");
            return Err(OperationError::Command {
                command,
                exit_code,
                stderr,
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|_| OperationError::Failed(format!("Output of `{}` is not valid UTF-8", command)))
    }
}

#[async_trait]
impl Operation for ShellCommand {
    fn name(&self) -> &str {
        "shell"
    }

    fn required_slots(&self) -> Vec<String> {
        vec![self.command_slot.clone()]
    }

    async fn invoke(&self, input: &OperationInput) -> Result<AdapterOutput, OperationError> {
        let line = input.text(&self.command_slot)?;
        let stdout = self.run(&line).await?;
        Ok(AdapterOutput::new(stdout))
    }
}
