//! Audit ledger entries describing a task's history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, TaskId, TaskStatus, UpdateId, UpdateKind};

/// An append-only record of something that happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// Unique entry identifier.
    pub id: UpdateId,
    /// Task this entry belongs to.
    pub task_id: TaskId,
    /// Agent involved, if any.
    pub agent_id: Option<AgentId>,
    pub kind: UpdateKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Insertion order assigned by the store; breaks timestamp ties.
    #[serde(default)]
    pub sequence: u64,
}

impl TaskUpdate {
    /// Create a new ledger entry stamped with the current time.
    pub fn new(
        task_id: TaskId,
        agent_id: Option<AgentId>,
        kind: UpdateKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: UpdateId::generate(),
            task_id,
            agent_id,
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    /// Create a StatusChange entry.
    pub fn status_change(
        task_id: TaskId,
        agent_id: Option<AgentId>,
        from: TaskStatus,
        to: TaskStatus,
        message: Option<&str>,
    ) -> Self {
        let content = match message {
            Some(m) if !m.is_empty() => format!("{} -> {}: {}", from, to, m),
            _ => format!("{} -> {}", from, to),
        };
        Self::new(task_id, agent_id, UpdateKind::StatusChange, content)
    }

    /// Create a ProgressUpdate entry.
    pub fn progress_update(
        task_id: TaskId,
        agent_id: Option<AgentId>,
        stage: TaskStatus,
        progress: u8,
        message: Option<&str>,
    ) -> Self {
        let content = match message {
            Some(m) if !m.is_empty() => format!("{} {}%: {}", stage, progress, m),
            _ => format!("{} {}%", stage, progress),
        };
        Self::new(task_id, agent_id, UpdateKind::ProgressUpdate, content)
    }

    /// Create a Note entry.
    pub fn note(task_id: TaskId, agent_id: Option<AgentId>, content: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, UpdateKind::Note, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_change_content() {
        let update = TaskUpdate::status_change(
            TaskId::new("t1"),
            Some(AgentId::new("a1")),
            TaskStatus::Design,
            TaskStatus::Build,
            Some("schema done"),
        );
        assert_eq!(update.kind, UpdateKind::StatusChange);
        assert_eq!(update.content, "design -> build: schema done");
        assert_eq!(update.agent_id, Some(AgentId::new("a1")));
    }

    #[test]
    fn test_progress_update_without_message() {
        let update =
            TaskUpdate::progress_update(TaskId::new("t1"), None, TaskStatus::Build, 40, None);
        assert_eq!(update.kind, UpdateKind::ProgressUpdate);
        assert_eq!(update.content, "build 40%");
    }
}
