//! Lifecycle state machine - applies validated stage transitions.
//!
//! [`plan_transition`] decides what a request means; this module writes it.
//! Terminal transitions release the agent in the same batch that finishes
//! the task, then ask the provisioner to archive the workspace.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use stagerun_core::{
    plan_transition, AgentId, CoreError, Task, TaskId, TaskStatus, TaskUpdate, Transition,
};

use crate::claim::released_agent;
use crate::ledger::AuditLedger;
use crate::provisioner::WorkspaceProvisioner;
use crate::store::{RecordStore, StoreError, WriteBatch};

/// Directory under a workspace root used as the default result location.
const OUTPUT_DIR: &str = "output";

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// Terminal transitions need an owning agent.
    #[error("task {0} has no assigned agent")]
    Unassigned(TaskId),

    /// The task changed between read and write.
    #[error("task {0} was modified concurrently")]
    Conflict(TaskId),

    #[error(transparent)]
    Store(StoreError),
}

impl LifecycleError {
    fn from_store(task_id: &TaskId, e: StoreError) -> Self {
        if e.is_conflict() {
            Self::Conflict(task_id.clone())
        } else {
            Self::Store(e)
        }
    }
}

/// A status/progress report against a task.
#[derive(Debug, Clone)]
pub struct AdvanceRequest {
    pub status: TaskStatus,
    pub stage_progress: i32,
    pub message: Option<String>,
    /// Only used when completing.
    pub result_path: Option<String>,
}

impl AdvanceRequest {
    pub fn new(status: TaskStatus, stage_progress: i32) -> Self {
        Self {
            status,
            stage_progress,
            message: None,
            result_path: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_result_path(mut self, path: impl Into<String>) -> Self {
        self.result_path = Some(path.into());
        self
    }
}

/// Result of an external cancellation request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The task is now `failed`.
    Cancelled(Task),
    /// The workspace is still being provisioned; the cancellation is applied
    /// once provisioning finishes or fails.
    Queued(Task),
}

impl CancelOutcome {
    pub fn task(&self) -> &Task {
        match self {
            Self::Cancelled(t) | Self::Queued(t) => t,
        }
    }
}

/// Validates and applies task status transitions.
#[derive(Clone)]
pub struct LifecycleMachine {
    store: Arc<dyn RecordStore>,
    ledger: AuditLedger,
    provisioner: Arc<WorkspaceProvisioner>,
}

impl LifecycleMachine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: AuditLedger,
        provisioner: Arc<WorkspaceProvisioner>,
    ) -> Self {
        Self {
            store,
            ledger,
            provisioner,
        }
    }

    /// Apply a status/progress report.
    ///
    /// Produces exactly one ledger entry per successful call: a
    /// `progress_update` when the stage stays the same, a `status_change`
    /// otherwise. Backward requests keep the stage, reset progress and are
    /// recorded as a `note`.
    pub async fn advance(
        &self,
        task_id: &TaskId,
        request: AdvanceRequest,
    ) -> Result<Task, LifecycleError> {
        let task = self.load(task_id).await?;
        let transition = plan_transition(task.status, request.status, request.stage_progress)?;

        let mut updated = task;
        let agent_id = updated.assigned_agent_id.clone();
        let message = request.message.as_deref();

        let entry = match transition {
            Transition::Progress { stage, progress } => {
                TaskUpdate::progress_update(updated.id.clone(), agent_id, stage, progress, message)
            }
            Transition::Advance { from, to, .. } => {
                TaskUpdate::status_change(updated.id.clone(), agent_id, from, to, message)
            }
            Transition::Rework { stage, requested } => {
                let content = match message {
                    Some(m) if !m.is_empty() => format!(
                        "rework requested ({}): staying in {}, progress reset: {}",
                        requested, stage, m
                    ),
                    _ => format!(
                        "rework requested ({}): staying in {}, progress reset",
                        requested, stage
                    ),
                };
                TaskUpdate::note(updated.id.clone(), agent_id, content)
            }
            Transition::Complete { .. } | Transition::Fail { .. } => {
                return self.finish(updated, transition, &request).await;
            }
        };

        updated.status = transition.target();
        updated.stage_progress = transition.progress(updated.stage_progress);
        updated.updated_at = Utc::now();

        let batch = WriteBatch::new().update_task(updated.clone());
        self.store
            .commit(self.ledger.attach(batch, entry))
            .await
            .map_err(|e| LifecycleError::from_store(task_id, e))?;
        updated.version += 1;

        info!(
            task_id = %updated.id,
            status = %updated.status,
            stage_progress = updated.stage_progress,
            "Task advanced"
        );
        Ok(updated)
    }

    /// Externally cancel an active task.
    ///
    /// If the claim's workspace does not exist yet the cancellation is queued
    /// on the task and applied by whoever finishes provisioning.
    pub async fn cancel(
        &self,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<CancelOutcome, LifecycleError> {
        let mut task = self.load(task_id).await?;
        if !task.status.is_active() {
            return Err(CoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Failed,
            }
            .into());
        }
        let Some(agent_id) = task.assigned_agent_id.clone() else {
            return Err(LifecycleError::Unassigned(task.id));
        };

        let workspace = self
            .store
            .find_workspace(&agent_id, task_id)
            .await
            .map_err(LifecycleError::Store)?;
        if workspace.is_some() {
            let request = AdvanceRequest::new(TaskStatus::Failed, task.stage_progress as i32)
                .with_message(format!("cancelled: {}", reason));
            return self.advance(task_id, request).await.map(CancelOutcome::Cancelled);
        }

        if !task.cancel_requested {
            task = self
                .queue_cancel(
                    task,
                    &agent_id,
                    format!("cancellation queued until workspace is ready: {}", reason),
                )
                .await?;
        }

        // Provisioning may have finished between the lookup and the write.
        match self.apply_queued_cancel(task_id).await? {
            Some(cancelled) => Ok(CancelOutcome::Cancelled(cancelled)),
            None => Ok(CancelOutcome::Queued(task)),
        }
    }

    /// Fail a task whose cancellation was queued, if its workspace now
    /// exists. Returns `None` when there is nothing to apply.
    pub async fn apply_queued_cancel(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<Task>, LifecycleError> {
        let task = self.load(task_id).await?;
        if !task.cancel_requested || !task.status.is_active() {
            return Ok(None);
        }
        let Some(agent_id) = task.assigned_agent_id.as_ref() else {
            return Ok(None);
        };
        if self
            .store
            .find_workspace(agent_id, task_id)
            .await
            .map_err(LifecycleError::Store)?
            .is_none()
        {
            return Ok(None);
        }

        let request = AdvanceRequest::new(TaskStatus::Failed, task.stage_progress as i32)
            .with_message("queued cancellation applied");
        match self.advance(task_id, request).await {
            Ok(task) => Ok(Some(task)),
            Err(LifecycleError::Invalid(CoreError::InvalidTransition { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn finish(
        &self,
        task: Task,
        transition: Transition,
        request: &AdvanceRequest,
    ) -> Result<Task, LifecycleError> {
        let Some(agent_id) = task.assigned_agent_id.clone() else {
            return Err(LifecycleError::Unassigned(task.id));
        };
        let task_id = task.id.clone();
        let from = task.status;

        let mut task = task;
        let mut workspace = self
            .store
            .find_workspace(&agent_id, &task_id)
            .await
            .map_err(LifecycleError::Store)?;

        // A failure reported while the workspace is still being created is
        // queued like a cancellation, so the workspace is archived once it
        // exists instead of outliving the task.
        if workspace.is_none() && matches!(transition, Transition::Fail { .. }) {
            if !task.cancel_requested {
                let content = match request.message.as_deref() {
                    Some(m) if !m.is_empty() => {
                        format!("failure queued until workspace is ready: {}", m)
                    }
                    _ => "failure queued until workspace is ready".to_string(),
                };
                task = self.queue_cancel(task, &agent_id, content).await?;
            }
            workspace = self
                .store
                .find_workspace(&agent_id, &task_id)
                .await
                .map_err(LifecycleError::Store)?;
            if workspace.is_none() {
                return Ok(task);
            }
        }

        let now = Utc::now();
        let mut finished = task;
        finished.status = transition.target();
        finished.stage_progress = transition.progress(finished.stage_progress);
        finished.assigned_agent_id = None;
        finished.cancel_requested = false;
        finished.completed_at = Some(now);
        finished.updated_at = now;

        if let Transition::Complete { .. } = transition {
            finished.result_path = request.result_path.clone().or_else(|| {
                workspace
                    .as_ref()
                    .map(|w| w.root_path.join(OUTPUT_DIR).display().to_string())
            });
        } else {
            finished.result_path = None;
        }

        let mut batch = WriteBatch::new().update_task(finished.clone());
        if let Some(agent) = released_agent(self.store.as_ref(), &agent_id, &task_id)
            .await
            .map_err(LifecycleError::Store)?
        {
            batch = batch.update_agent(agent);
        }
        let entry = TaskUpdate::status_change(
            task_id.clone(),
            Some(agent_id.clone()),
            from,
            finished.status,
            request.message.as_deref(),
        );
        self.store
            .commit(self.ledger.attach(batch, entry))
            .await
            .map_err(|e| LifecycleError::from_store(&task_id, e))?;
        finished.version += 1;

        info!(
            task_id = %task_id,
            agent_id = %agent_id,
            status = %finished.status,
            result_path = ?finished.result_path,
            "Task finished"
        );

        if let Some(workspace) = workspace {
            if let Err(e) = self.provisioner.archive(&workspace.id).await {
                warn!(
                    task_id = %task_id,
                    workspace_id = %workspace.id,
                    error = %e,
                    "Failed to archive workspace, left for the scheduler sweep"
                );
            }
        }

        Ok(finished)
    }

    /// Mark `task` as waiting for its workspace before it can be failed.
    async fn queue_cancel(
        &self,
        mut task: Task,
        agent_id: &AgentId,
        content: String,
    ) -> Result<Task, LifecycleError> {
        let task_id = task.id.clone();
        task.cancel_requested = true;
        task.updated_at = Utc::now();
        let entry = TaskUpdate::note(task_id.clone(), Some(agent_id.clone()), content);
        let batch = WriteBatch::new().update_task(task.clone());
        self.store
            .commit(self.ledger.attach(batch, entry))
            .await
            .map_err(|e| LifecycleError::from_store(&task_id, e))?;
        task.version += 1;
        info!(task_id = %task_id, agent_id = %agent_id, "Cancellation queued");
        Ok(task)
    }

    async fn load(&self, task_id: &TaskId) -> Result<Task, LifecycleError> {
        self.store
            .get_task(task_id)
            .await
            .map_err(LifecycleError::Store)?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimCoordinator;
    use crate::store::MemoryStore;
    use stagerun_core::{Agent, AgentStatus, ComplexityRange, UpdateKind, WorkspacePhase};
    use std::time::Duration;

    struct Fixture {
        store: Arc<dyn RecordStore>,
        lifecycle: LifecycleMachine,
        claims: ClaimCoordinator,
        provisioner: Arc<WorkspaceProvisioner>,
        task: Task,
        agent: Agent,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let ledger = AuditLedger::new(store.clone());
        let provisioner = Arc::new(WorkspaceProvisioner::new(
            store.clone(),
            dir.path(),
            Duration::from_secs(5),
        ));
        let task = Task::new("t", "d", 5);
        let agent = Agent::new("m", "http://a", ComplexityRange::new(1, 5).unwrap());
        store
            .commit(
                WriteBatch::new()
                    .insert_task(task.clone())
                    .insert_agent(agent.clone()),
            )
            .await
            .unwrap();
        Fixture {
            lifecycle: LifecycleMachine::new(store.clone(), ledger.clone(), provisioner.clone()),
            claims: ClaimCoordinator::new(store.clone(), ledger),
            store,
            provisioner,
            task,
            agent,
            _dir: dir,
        }
    }

    impl Fixture {
        async fn claim_and_provision(&self) {
            let claim = self.claims.claim(&self.task.id, &self.agent.id).await.unwrap();
            self.provisioner.provision(&claim.agent, &claim.task).await.unwrap();
        }

        async fn updates(&self) -> Vec<TaskUpdate> {
            self.store.list_updates(&self.task.id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_skipping_a_stage_is_rejected() {
        let f = fixture().await;
        f.claim_and_provision().await;

        let err = f
            .lifecycle
            .advance(&f.task.id, AdvanceRequest::new(TaskStatus::Test, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Invalid(CoreError::InvalidTransition {
                from: TaskStatus::Design,
                to: TaskStatus::Test
            })
        ));
    }

    #[tokio::test]
    async fn test_progress_within_stage_writes_one_progress_update() {
        let f = fixture().await;
        f.claim_and_provision().await;
        f.lifecycle
            .advance(&f.task.id, AdvanceRequest::new(TaskStatus::Build, 10))
            .await
            .unwrap();
        let before = f.updates().await.len();

        let task = f
            .lifecycle
            .advance(&f.task.id, AdvanceRequest::new(TaskStatus::Build, 60))
            .await
            .unwrap();
        assert_eq!(task.stage_progress, 60);

        let updates = f.updates().await;
        assert_eq!(updates.len(), before + 1);
        assert_eq!(updates.last().unwrap().kind, UpdateKind::ProgressUpdate);
    }

    #[tokio::test]
    async fn test_out_of_range_progress_is_rejected() {
        let f = fixture().await;
        f.claim_and_provision().await;

        let err = f
            .lifecycle
            .advance(&f.task.id, AdvanceRequest::new(TaskStatus::Design, 101))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Invalid(CoreError::InvalidProgress(101))));
    }

    #[tokio::test]
    async fn test_backward_request_resets_progress_with_note() {
        let f = fixture().await;
        f.claim_and_provision().await;
        for (status, progress) in [(TaskStatus::Build, 0), (TaskStatus::Test, 70)] {
            f.lifecycle
                .advance(&f.task.id, AdvanceRequest::new(status, progress))
                .await
                .unwrap();
        }

        let task = f
            .lifecycle
            .advance(&f.task.id, AdvanceRequest::new(TaskStatus::Build, 50))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Test);
        assert_eq!(task.stage_progress, 0);
        assert_eq!(f.updates().await.last().unwrap().kind, UpdateKind::Note);
    }

    #[tokio::test]
    async fn test_completion_releases_agent_and_archives_workspace() {
        let f = fixture().await;
        f.claim_and_provision().await;
        for status in [
            TaskStatus::Build,
            TaskStatus::Test,
            TaskStatus::Review,
            TaskStatus::Complete,
        ] {
            f.lifecycle
                .advance(&f.task.id, AdvanceRequest::new(status, 100))
                .await
                .unwrap();
        }

        let task = f.store.get_task(&f.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.assigned_agent_id.is_none());
        assert!(task.completed_at.is_some());
        assert!(task.result_path.as_deref().unwrap().ends_with("output"));

        let agent = f.store.get_agent(&f.agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);

        let ws = f
            .store
            .find_workspace(&f.agent.id, &f.task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ws.phase, WorkspacePhase::Archived);

        let err = f
            .lifecycle
            .advance(&f.task.id, AdvanceRequest::new(TaskStatus::Review, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Invalid(CoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_explicit_result_path_wins() {
        let f = fixture().await;
        f.claim_and_provision().await;
        for status in [TaskStatus::Build, TaskStatus::Test, TaskStatus::Review] {
            f.lifecycle
                .advance(&f.task.id, AdvanceRequest::new(status, 100))
                .await
                .unwrap();
        }
        let task = f
            .lifecycle
            .advance(
                &f.task.id,
                AdvanceRequest::new(TaskStatus::Complete, 100).with_result_path("/out/report.md"),
            )
            .await
            .unwrap();
        assert_eq!(task.result_path.as_deref(), Some("/out/report.md"));
    }

    #[tokio::test]
    async fn test_cancel_active_task_fails_it() {
        let f = fixture().await;
        f.claim_and_provision().await;

        let outcome = f.lifecycle.cancel(&f.task.id, "no longer needed").await.unwrap();
        let task = match outcome {
            CancelOutcome::Cancelled(task) => task,
            CancelOutcome::Queued(_) => panic!("expected immediate cancellation"),
        };
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result_path.is_none());

        let agent = f.store.get_agent(&f.agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        let last = f.updates().await.pop().unwrap();
        assert_eq!(last.kind, UpdateKind::StatusChange);
        assert!(last.content.contains("no longer needed"));
    }

    #[tokio::test]
    async fn test_cancel_before_workspace_is_queued_then_applied() {
        let f = fixture().await;
        let claim = f.claims.claim(&f.task.id, &f.agent.id).await.unwrap();

        let outcome = f.lifecycle.cancel(&f.task.id, "stop").await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Queued(_)));
        assert!(outcome.task().cancel_requested);

        f.provisioner.provision(&claim.agent, &claim.task).await.unwrap();
        let task = f.lifecycle.apply_queued_cancel(&f.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.cancel_requested);
    }

    #[tokio::test]
    async fn test_failure_before_workspace_is_queued_then_applied() {
        let f = fixture().await;
        let claim = f.claims.claim(&f.task.id, &f.agent.id).await.unwrap();

        let task = f
            .lifecycle
            .advance(
                &f.task.id,
                AdvanceRequest::new(TaskStatus::Failed, 0).with_message("toolchain missing"),
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Design);
        assert!(task.cancel_requested);
        let note = f.updates().await.pop().unwrap();
        assert_eq!(note.kind, UpdateKind::Note);
        assert!(note.content.contains("toolchain missing"));

        let workspace = f.provisioner.provision(&claim.agent, &claim.task).await.unwrap();
        let task = f.lifecycle.apply_queued_cancel(&f.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let workspace = f.store.get_workspace(&workspace.id).await.unwrap().unwrap();
        assert_eq!(workspace.phase, WorkspacePhase::Archived);
    }

    #[tokio::test]
    async fn test_cancel_not_started_is_rejected() {
        let f = fixture().await;
        let err = f.lifecycle.cancel(&f.task.id, "x").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Invalid(CoreError::InvalidTransition { .. })));
    }
}
