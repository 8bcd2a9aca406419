//! Task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, CoreError, TaskId, TaskStatus};

/// Priority used when a task is created without one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Lowest and highest value accepted for complexity and priority.
pub const SCALE_MIN: u8 = 1;
pub const SCALE_MAX: u8 = 10;

/// A Task is a unit of work progressing through the fixed stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    pub title: String,

    pub description: String,

    /// Difficulty on a 1-10 scale, matched against agent complexity ranges.
    pub complexity: u8,

    /// Scheduling priority on a 1-10 scale; higher is scheduled first.
    pub priority: u8,

    /// Current status.
    pub status: TaskStatus,

    /// Progress within the current stage, 0-100.
    pub stage_progress: u8,

    /// Owning agent. Set iff the task is in an active stage.
    pub assigned_agent_id: Option<AgentId>,

    /// Location of the task output. Set only on completion.
    pub result_path: Option<String>,

    /// Cancellation received while the workspace was still being provisioned.
    #[serde(default)]
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Record version used by the store's compare-and-swap.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Create a new Task in `not_started` with the default priority.
    pub fn new(title: impl Into<String>, description: impl Into<String>, complexity: u8) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            title: title.into(),
            description: description.into(),
            complexity,
            priority: DEFAULT_PRIORITY,
            status: TaskStatus::NotStarted,
            stage_progress: 0,
            assigned_agent_id: None,
            result_path: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to set the creation time (useful for testing ordering).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check the ownership invariant: an agent is assigned iff the task is
    /// in an active stage.
    pub fn ownership_consistent(&self) -> bool {
        self.assigned_agent_id.is_some() == self.status.is_active()
    }

    /// Validate user-supplied fields.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.title.trim().is_empty() {
            return Err(CoreError::InvalidInput("title is required".to_string()));
        }
        check_scale("complexity", self.complexity)?;
        check_scale("priority", self.priority)?;
        Ok(())
    }
}

fn check_scale(field: &str, value: u8) -> Result<(), CoreError> {
    if !(SCALE_MIN..=SCALE_MAX).contains(&value) {
        return Err(CoreError::InvalidInput(format!(
            "{} must be between {} and {}, got {}",
            field, SCALE_MIN, SCALE_MAX, value
        )));
    }
    Ok(())
}

/// Request to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub complexity: u8,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl NewTask {
    /// Build the validated `not_started` task.
    pub fn into_task(self) -> Result<Task, CoreError> {
        let task = Task::new(self.title, self.description, self.complexity)
            .with_priority(self.priority.unwrap_or(DEFAULT_PRIORITY));
        task.validate()?;
        Ok(task)
    }
}
