//! Workspace provisioner - per-(agent, task) execution environments.
//!
//! Workspaces are created right after a successful claim, archived when the
//! task reaches a terminal state, and deleted only when an external retention
//! policy asks for it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use stagerun_core::{Agent, AgentId, Task, TaskId, Workspace, WorkspaceId, WorkspacePhase};

use crate::store::{RecordStore, StoreError, WriteBatch};

const ENVIRONMENT_DIR: &str = "env";
const MANIFEST_FILE: &str = "manifest.json";
const ARCHIVE_ATTEMPTS: usize = 5;

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning timed out after {0:?}")]
    Timeout(Duration),

    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workspace {0} not found")]
    NotFound(WorkspaceId),

    /// Only archived workspaces may be deleted.
    #[error("workspace {0} is still active")]
    WorkspaceActive(WorkspaceId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a workspace lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub root_path: PathBuf,
    pub environment_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Initial manifest written into every workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub title: String,
    pub description: String,
    pub complexity: u8,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceManifest {
    pub fn new(agent: &Agent, task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            complexity: task.complexity,
            created_at: Utc::now(),
        }
    }
}

/// Creates and removes the on-disk side of a workspace.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Establish the workspace root, the isolated environment root and the manifest.
    async fn create(
        &self,
        layout: &WorkspaceLayout,
        manifest: &WorkspaceManifest,
    ) -> std::io::Result<()>;

    /// Remove everything under `root`. Missing directories are not an error.
    async fn destroy(&self, root: &Path) -> std::io::Result<()>;
}

/// Plain directory-based environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsEnvironment;

#[async_trait]
impl Environment for FsEnvironment {
    async fn create(
        &self,
        layout: &WorkspaceLayout,
        manifest: &WorkspaceManifest,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&layout.environment_path).await?;
        let raw = serde_json::to_vec_pretty(manifest).map_err(std::io::Error::other)?;
        tokio::fs::write(&layout.manifest_path, raw).await
    }

    async fn destroy(&self, root: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(root).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Provisions, archives and deletes workspaces.
pub struct WorkspaceProvisioner {
    store: Arc<dyn RecordStore>,
    environment: Arc<dyn Environment>,
    base: PathBuf,
    timeout: Duration,
}

impl WorkspaceProvisioner {
    /// Create a provisioner using plain directories under `base`.
    pub fn new(store: Arc<dyn RecordStore>, base: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            store,
            environment: Arc::new(FsEnvironment),
            base: base.into(),
            timeout,
        }
    }

    /// Builder method to swap the environment implementation.
    pub fn with_environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = environment;
        self
    }

    /// Base directory workspaces are created under.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Compute the on-disk layout for an (agent, task) pair.
    pub fn layout_for(&self, agent: &Agent, task: &Task) -> WorkspaceLayout {
        let root_path = self.base.join(&agent.workspace_root).join(task.id.as_str());
        WorkspaceLayout {
            environment_path: root_path.join(ENVIRONMENT_DIR),
            manifest_path: root_path.join(MANIFEST_FILE),
            root_path,
        }
    }

    /// Return the workspace for (agent, task), creating it if needed.
    ///
    /// Calling this again for the same pair returns the existing record.
    pub async fn provision(&self, agent: &Agent, task: &Task) -> Result<Workspace, ProvisionError> {
        if let Some(existing) = self.store.find_workspace(&agent.id, &task.id).await? {
            return Ok(existing);
        }

        let layout = self.layout_for(agent, task);
        let manifest = WorkspaceManifest::new(agent, task);

        match tokio::time::timeout(self.timeout, self.environment.create(&layout, &manifest)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(task_id = %task.id, agent_id = %agent.id, error = %e, "Workspace creation failed");
                self.discard_partial(&layout).await;
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    timeout = ?self.timeout,
                    "Workspace creation timed out"
                );
                self.discard_partial(&layout).await;
                return Err(ProvisionError::Timeout(self.timeout));
            }
        }

        let mut workspace = Workspace::new(
            agent.id.clone(),
            task.id.clone(),
            layout.root_path,
            layout.environment_path,
        );

        match self
            .store
            .commit(WriteBatch::new().insert_workspace(workspace.clone()))
            .await
        {
            Ok(()) => {
                workspace.version = 1;
                info!(
                    workspace_id = %workspace.id,
                    task_id = %task.id,
                    agent_id = %agent.id,
                    root = %workspace.root_path.display(),
                    "Workspace provisioned"
                );
                Ok(workspace)
            }
            Err(StoreError::Duplicate { .. }) => {
                // Lost a race with a concurrent provision for the same pair.
                self.store
                    .find_workspace(&agent.id, &task.id)
                    .await?
                    .ok_or(ProvisionError::NotFound(workspace.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a workspace archived. Already archived or deleted workspaces are
    /// returned unchanged.
    pub async fn archive(&self, workspace_id: &WorkspaceId) -> Result<Workspace, ProvisionError> {
        let mut last_err = None;

        for _ in 0..ARCHIVE_ATTEMPTS {
            let mut workspace = self.load(workspace_id).await?;
            if workspace.phase != WorkspacePhase::Active {
                return Ok(workspace);
            }

            workspace.phase = WorkspacePhase::Archived;
            workspace.last_accessed = Utc::now();

            match self
                .store
                .commit(WriteBatch::new().update_workspace(workspace.clone()))
                .await
            {
                Ok(()) => {
                    workspace.version += 1;
                    info!(workspace_id = %workspace.id, task_id = %workspace.task_id, "Workspace archived");
                    return Ok(workspace);
                }
                Err(e) if e.is_conflict() => last_err = Some(e),
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err
            .map(ProvisionError::from)
            .unwrap_or_else(|| ProvisionError::NotFound(workspace_id.clone())))
    }

    /// Remove an archived workspace from disk and mark it deleted.
    pub async fn delete(&self, workspace_id: &WorkspaceId) -> Result<Workspace, ProvisionError> {
        let mut workspace = self.load(workspace_id).await?;
        match workspace.phase {
            WorkspacePhase::Active => {
                return Err(ProvisionError::WorkspaceActive(workspace.id));
            }
            WorkspacePhase::Deleted => return Ok(workspace),
            WorkspacePhase::Archived => {}
        }

        self.environment.destroy(&workspace.root_path).await?;

        workspace.phase = WorkspacePhase::Deleted;
        workspace.last_accessed = Utc::now();
        self.store
            .commit(WriteBatch::new().update_workspace(workspace.clone()))
            .await?;
        workspace.version += 1;

        info!(workspace_id = %workspace.id, root = %workspace.root_path.display(), "Workspace deleted");
        Ok(workspace)
    }

    /// Best-effort removal of whatever a failed `create` left on disk.
    async fn discard_partial(&self, layout: &WorkspaceLayout) {
        if let Err(e) = self.environment.destroy(&layout.root_path).await {
            warn!(root = %layout.root_path.display(), error = %e, "Failed to clean up partial workspace");
        }
    }

    /// Archived workspaces whose retention period has elapsed at `now`.
    pub async fn expired(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<Vec<Workspace>, ProvisionError> {
        let workspaces = self.store.list_workspaces().await?;
        Ok(workspaces
            .into_iter()
            .filter(|w| w.phase == WorkspacePhase::Archived)
            .filter(|w| {
                (now - w.last_accessed)
                    .to_std()
                    .map(|age| age >= retention)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Delete every expired workspace. Returns the ids that were deleted.
    pub async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<Vec<WorkspaceId>, ProvisionError> {
        let mut deleted = Vec::new();
        for workspace in self.expired(now, retention).await? {
            match self.delete(&workspace.id).await {
                Ok(w) => deleted.push(w.id),
                Err(ProvisionError::Store(e)) if e.is_conflict() => {
                    warn!(workspace_id = %workspace.id, "Workspace changed during purge, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    async fn load(&self, workspace_id: &WorkspaceId) -> Result<Workspace, ProvisionError> {
        self.store
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(workspace_id.clone()))
    }
}
