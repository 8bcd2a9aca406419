//! Workspace operations triggered from outside the scheduler: listing,
//! retention-based deletion, and running tools inside a workspace.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use stagerun_core::{CoreError, Workspace, WorkspaceId, WorkspacePhase};

use crate::executor::ExecutionOutput;
use crate::service::ServiceError;
use crate::state::AppState;

/// Workspace operations over the shared state.
#[derive(Clone)]
pub struct WorkspaceService {
    state: Arc<AppState>,
}

impl WorkspaceService {
    /// Create a new WorkspaceService.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// List workspaces, optionally in one phase, newest first.
    pub async fn list_workspaces(
        &self,
        phase: Option<WorkspacePhase>,
    ) -> Result<Vec<Workspace>, ServiceError> {
        let mut workspaces: Vec<Workspace> = self
            .state
            .store
            .list_workspaces()
            .await?
            .into_iter()
            .filter(|w| phase.map_or(true, |p| w.phase == p))
            .collect();
        workspaces.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workspaces)
    }

    pub async fn get_workspace(&self, workspace_id: &WorkspaceId) -> Result<Workspace, ServiceError> {
        self.state
            .store
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| CoreError::WorkspaceNotFound(workspace_id.to_string()).into())
    }

    /// Delete one archived workspace.
    pub async fn delete_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Workspace, ServiceError> {
        Ok(self.state.provisioner.delete(workspace_id).await?)
    }

    /// Delete archived workspaces older than the configured retention.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<WorkspaceId>, ServiceError> {
        let retention = self.state.config.retention;
        let purged = self.state.provisioner.purge_expired(now, retention).await?;
        info!(count = purged.len(), retention = ?retention, "Expired workspaces purged");
        Ok(purged)
    }

    /// Run a command in an active workspace.
    pub async fn execute(
        &self,
        workspace_id: &WorkspaceId,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, ServiceError> {
        let workspace = self.get_workspace(workspace_id).await?;
        if !workspace.is_active() {
            return Err(ServiceError::InvalidInput(format!(
                "workspace {} is {}",
                workspace.id, workspace.phase
            )));
        }

        let timeout = timeout.unwrap_or(self.state.config.exec_timeout);
        Ok(self
            .state
            .executor
            .execute(command, &workspace.root_path, timeout)
            .await?)
    }
}
