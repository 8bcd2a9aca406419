//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for StageRun.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Agent not found.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Workspace not found.
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// Requested status change is not allowed from the current status.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Stage progress outside 0..=100.
    #[error("Invalid stage progress: {0} (expected 0-100)")]
    InvalidProgress(i32),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
