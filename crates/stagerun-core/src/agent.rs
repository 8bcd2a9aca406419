//! Agent record and capability range.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{SCALE_MAX, SCALE_MIN};
use crate::{AgentId, AgentStatus, CoreError};

/// Inclusive range of task complexities an agent accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityRange {
    pub min: u8,
    pub max: u8,
}

impl ComplexityRange {
    /// Create a validated range, `1 <= min <= max <= 10`.
    pub fn new(min: u8, max: u8) -> Result<Self, CoreError> {
        if min < SCALE_MIN || max > SCALE_MAX || min > max {
            return Err(CoreError::InvalidInput(format!(
                "complexity range [{}, {}] must satisfy {} <= min <= max <= {}",
                min, max, SCALE_MIN, SCALE_MAX
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, complexity: u8) -> bool {
        (self.min..=self.max).contains(&complexity)
    }
}

/// A worker capable of executing tasks within a complexity range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier.
    pub id: AgentId,

    /// Model identifier (e.g., "claude-sonnet", "gpt-4o").
    pub model: String,

    /// Network endpoint the agent is reachable at.
    pub endpoint: String,

    pub status: AgentStatus,

    pub complexity_range: ComplexityRange,

    /// Directory under which this agent's workspaces are created. Relative
    /// paths are resolved against the configured workspace base.
    pub workspace_root: String,

    /// Last time the agent was handed a claim. Drives least-recently-used matching.
    pub last_active: DateTime<Utc>,

    /// Last health signal received from the agent.
    pub last_heartbeat: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    /// Record version used by the store's compare-and-swap.
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    /// Create a new available Agent.
    pub fn new(
        model: impl Into<String>,
        endpoint: impl Into<String>,
        complexity_range: ComplexityRange,
    ) -> Self {
        let now = Utc::now();
        let id = AgentId::generate();
        Self {
            workspace_root: id.as_str().to_string(),
            id,
            model: model.into(),
            endpoint: endpoint.into(),
            status: AgentStatus::Available,
            complexity_range,
            last_active: now,
            last_heartbeat: now,
            created_at: now,
            version: 0,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to set the workspace root.
    pub fn with_workspace_root(mut self, root: impl Into<String>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Builder method to set `last_active` (useful for testing matching order).
    pub fn with_last_active(mut self, at: DateTime<Utc>) -> Self {
        self.last_active = at;
        self
    }

    /// Check if this agent could take a task of the given complexity right now.
    pub fn can_take(&self, complexity: u8) -> bool {
        self.status == AgentStatus::Available && self.complexity_range.contains(complexity)
    }
}
