//! Workspace record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, TaskId, WorkspaceId, WorkspacePhase};

/// The isolated execution environment backing one (agent, task) assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    /// Directory the agent works in.
    pub root_path: PathBuf,
    /// Isolated interpreter/toolchain root inside `root_path`.
    pub environment_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub phase: WorkspacePhase,
    /// Record version used by the store's compare-and-swap.
    #[serde(default)]
    pub version: u64,
}

impl Workspace {
    /// Create a new active workspace record.
    pub fn new(
        agent_id: AgentId,
        task_id: TaskId,
        root_path: PathBuf,
        environment_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkspaceId::generate(),
            agent_id,
            task_id,
            root_path,
            environment_path,
            created_at: now,
            last_accessed: now,
            phase: WorkspacePhase::Active,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == WorkspacePhase::Active
    }
}
