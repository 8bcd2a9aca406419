//! Tool execution inside a workspace.
//!
//! The control plane only hands an executor the workspace root; what runs
//! there is the agent's business.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The workspace root is outside the configured workspace base.
    #[error("refusing to execute outside workspace base: {0}")]
    Security(String),

    #[error("execution I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

/// Runs a capability against a workspace under a time limit.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        workspace_root: &Path,
        timeout: Duration,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

/// Runs commands with `sh -c` in the workspace root.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    base: PathBuf,
}

impl ShellExecutor {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn confine(&self, workspace_root: &Path) -> Result<PathBuf, ExecutionError> {
        let base = self
            .base
            .canonicalize()
            .map_err(|e| ExecutionError::Security(format!("{}: {}", self.base.display(), e)))?;
        let root = workspace_root.canonicalize().map_err(|e| {
            ExecutionError::Security(format!("{}: {}", workspace_root.display(), e))
        })?;
        if !root.starts_with(&base) {
            return Err(ExecutionError::Security(root.display().to_string()));
        }
        Ok(root)
    }
}

#[async_trait]
impl ToolExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        workspace_root: &Path,
        timeout: Duration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let root = self.confine(workspace_root)?;

        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(root = %root.display(), timeout = ?timeout, "Command timed out");
                return Err(ExecutionError::Timeout(timeout));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(root = %root.display(), exit_code, "Command finished");

        Ok(ExecutionOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}
