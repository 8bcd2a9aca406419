//! Status enums for Tasks, Agents, Workspaces and ledger entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Status of a Task.
///
/// The active stages run strictly forward: `design -> build -> test -> review`,
/// followed by `complete`. `failed` is reachable from any active stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet claimed by an agent.
    #[default]
    NotStarted,
    Design,
    Build,
    Test,
    Review,
    /// Finished successfully. Immutable from here on.
    Complete,
    /// Finished unsuccessfully. Never retried automatically.
    Failed,
}

impl TaskStatus {
    /// The active stages in execution order.
    pub const STAGES: [TaskStatus; 4] = [Self::Design, Self::Build, Self::Test, Self::Review];

    /// Stage a freshly claimed task starts in.
    pub const FIRST_STAGE: TaskStatus = Self::Design;

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns true if the task is in one of the active stages.
    pub fn is_active(&self) -> bool {
        self.stage_index().is_some()
    }

    /// Position in [`TaskStatus::STAGES`], `None` for non-stage statuses.
    pub fn stage_index(&self) -> Option<usize> {
        Self::STAGES.iter().position(|s| s == self)
    }

    /// The status that strictly follows this one on the forward path.
    pub fn next(&self) -> Option<TaskStatus> {
        match self {
            Self::NotStarted => Some(Self::Design),
            Self::Design => Some(Self::Build),
            Self::Build => Some(Self::Test),
            Self::Test => Some(Self::Review),
            Self::Review => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Design => "design",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Every status, in declaration order.
    pub fn all() -> &'static [TaskStatus] {
        &[
            Self::NotStarted,
            Self::Design,
            Self::Build,
            Self::Test,
            Self::Review,
            Self::Complete,
            Self::Failed,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown task status '{}'", s)))
    }
}

/// Availability of an Agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Idle and eligible for new claims.
    #[default]
    Available,
    /// Holds an active task claim.
    Busy,
    /// Not reachable; never matched.
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(CoreError::InvalidInput(format!(
                "unknown agent status '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle phase of a Workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspacePhase {
    /// Backing an in-flight (agent, task) assignment.
    #[default]
    Active,
    /// Task reached a terminal state; kept read-only until retention expires.
    Archived,
    /// Removed from disk by the retention policy.
    Deleted,
}

impl WorkspacePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an audit ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// The task moved to a different status.
    StatusChange,
    /// Progress changed within the current stage.
    ProgressUpdate,
    /// Free-form observation (rework, rollback, queued cancellation, ...).
    Note,
}
