//! Record store for tasks, agents, workspaces and the audit ledger.
//!
//! Every mutation goes through [`RecordStore::commit`], which applies a
//! [`WriteBatch`] atomically. Each put carries the record version the writer
//! read; if any version no longer matches, nothing is written and the commit
//! fails with [`StoreError::VersionConflict`]. This compare-and-swap is the
//! only cross-instance synchronisation the control plane relies on.
//!
//! A successful put stores the record with `version = expected + 1`
//! (or `1` for an insert).

mod memory;

use async_trait::async_trait;
use thiserror::Error;

use stagerun_core::{
    Agent, AgentId, Task, TaskId, TaskStatus, TaskUpdate, Workspace, WorkspaceId,
};

pub use memory::MemoryStore;

/// Record store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached. Fatal for the current unit of work.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record changed since it was read.
    #[error("{kind} {id} was modified concurrently")]
    VersionConflict { kind: &'static str, id: String },

    /// An insert collided with an existing record or unique key.
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: String },

    /// A referenced record does not exist.
    #[error("{kind} {id} does not exist")]
    MissingRecord { kind: &'static str, id: String },

    /// The batch itself is malformed (e.g. two puts for one record).
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True when retrying against fresh state may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Duplicate { .. })
    }
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutTask { record: Task, expected: Option<u64> },
    PutAgent { record: Agent, expected: Option<u64> },
    PutWorkspace { record: Workspace, expected: Option<u64> },
    AppendUpdate(TaskUpdate),
}

/// A set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task that must not exist yet.
    pub fn insert_task(mut self, task: Task) -> Self {
        self.ops.push(WriteOp::PutTask {
            record: task,
            expected: None,
        });
        self
    }

    /// Overwrite a task, expecting the version it carries.
    pub fn update_task(mut self, task: Task) -> Self {
        let expected = Some(task.version);
        self.ops.push(WriteOp::PutTask {
            record: task,
            expected,
        });
        self
    }

    /// Insert an agent that must not exist yet.
    pub fn insert_agent(mut self, agent: Agent) -> Self {
        self.ops.push(WriteOp::PutAgent {
            record: agent,
            expected: None,
        });
        self
    }

    /// Overwrite an agent, expecting the version it carries.
    pub fn update_agent(mut self, agent: Agent) -> Self {
        let expected = Some(agent.version);
        self.ops.push(WriteOp::PutAgent {
            record: agent,
            expected,
        });
        self
    }

    /// Insert a workspace; fails if its (agent, task) pair is taken.
    pub fn insert_workspace(mut self, workspace: Workspace) -> Self {
        self.ops.push(WriteOp::PutWorkspace {
            record: workspace,
            expected: None,
        });
        self
    }

    /// Overwrite a workspace, expecting the version it carries.
    pub fn update_workspace(mut self, workspace: Workspace) -> Self {
        let expected = Some(workspace.version);
        self.ops.push(WriteOp::PutWorkspace {
            record: workspace,
            expected,
        });
        self
    }

    /// Append a ledger entry.
    pub fn append(mut self, update: TaskUpdate) -> Self {
        self.ops.push(WriteOp::AppendUpdate(update));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Filter for [`RecordStore::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_agent: Option<AgentId>,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn assigned_to(agent_id: AgentId) -> Self {
        Self {
            assigned_agent: Some(agent_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(agent_id) = &self.assigned_agent {
            if task.assigned_agent_id.as_ref() != Some(agent_id) {
                return false;
            }
        }
        true
    }
}

/// Durable storage with atomic multi-record compare-and-swap.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    async fn get_agent(&self, id: &AgentId) -> Result<Option<Agent>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;

    async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError>;

    /// Look up the workspace for an (agent, task) pair.
    async fn find_workspace(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
    ) -> Result<Option<Workspace>, StoreError>;

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError>;

    /// Ledger entries for a task ordered by `(timestamp, sequence)`.
    async fn list_updates(&self, task_id: &TaskId) -> Result<Vec<TaskUpdate>, StoreError>;

    /// Apply every write in `batch` or none of them.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_status_and_agent() {
        let mut task = Task::new("t", "", 2);
        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::with_status(TaskStatus::NotStarted).matches(&task));
        assert!(!TaskFilter::with_status(TaskStatus::Build).matches(&task));

        task.assigned_agent_id = Some(AgentId::new("a1"));
        assert!(TaskFilter::assigned_to(AgentId::new("a1")).matches(&task));
        assert!(!TaskFilter::assigned_to(AgentId::new("a2")).matches(&task));
    }

    #[test]
    fn test_update_carries_read_version() {
        let mut task = Task::new("t", "", 2);
        task.version = 7;
        let batch = WriteBatch::new().update_task(task);
        match &batch.ops()[0] {
            WriteOp::PutTask { expected, .. } => assert_eq!(*expected, Some(7)),
            other => panic!("unexpected op {:?}", other),
        }
    }
}
