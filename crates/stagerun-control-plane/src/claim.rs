//! Claim coordinator - binds a task to an agent atomically.
//!
//! A claim reads the task and the agent, checks that both are free, and
//! writes task, agent and the ledger entry in one compare-and-swap batch. If
//! another scheduler got there first the batch is rejected and the caller
//! must re-match instead of retrying the same pair.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use stagerun_core::{Agent, AgentId, AgentStatus, CoreError, Task, TaskId, TaskStatus, TaskUpdate};

use crate::ledger::AuditLedger;
use crate::store::{RecordStore, StoreError, TaskFilter, WriteBatch};

/// How many times compensating writes re-read state after losing a race.
const RELEASE_ATTEMPTS: usize = 5;

/// Claim errors.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// A precondition did not hold at commit time. Re-match, don't retry.
    #[error("claim conflict: {0}")]
    Conflict(String),

    /// The agent's complexity range does not cover the task.
    #[error("agent {agent_id} cannot take complexity {complexity}")]
    Ineligible { agent_id: AgentId, complexity: u8 },

    #[error(transparent)]
    NotFound(#[from] CoreError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ClaimError {
    fn from(e: StoreError) -> Self {
        if e.is_conflict() {
            Self::Conflict(e.to_string())
        } else {
            Self::Store(e)
        }
    }
}

/// A successful claim: the task and agent as committed.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: Task,
    pub agent: Agent,
}

/// Performs claims and their compensating rollbacks.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn RecordStore>,
    ledger: AuditLedger,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn RecordStore>, ledger: AuditLedger) -> Self {
        Self { store, ledger }
    }

    /// Bind `task_id` to `agent_id` and move the task into its first stage.
    pub async fn claim(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<Claim, ClaimError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;

        if task.status != TaskStatus::NotStarted || task.assigned_agent_id.is_some() {
            return Err(ClaimError::Conflict(format!(
                "task {} is {} (agent {:?})",
                task.id, task.status, task.assigned_agent_id
            )));
        }
        if agent.status != AgentStatus::Available {
            return Err(ClaimError::Conflict(format!(
                "agent {} is {}",
                agent.id, agent.status
            )));
        }
        if !agent.complexity_range.contains(task.complexity) {
            return Err(ClaimError::Ineligible {
                agent_id: agent.id,
                complexity: task.complexity,
            });
        }

        let now = Utc::now();

        let mut claimed = task;
        claimed.status = TaskStatus::FIRST_STAGE;
        claimed.stage_progress = 0;
        claimed.assigned_agent_id = Some(agent.id.clone());
        claimed.cancel_requested = false;
        claimed.updated_at = now;

        let mut busy = agent;
        busy.status = AgentStatus::Busy;
        busy.last_active = now;

        let entry = TaskUpdate::status_change(
            claimed.id.clone(),
            Some(busy.id.clone()),
            TaskStatus::NotStarted,
            claimed.status,
            Some(&format!("claimed by agent {}", busy.id)),
        );
        let batch = WriteBatch::new()
            .update_task(claimed.clone())
            .update_agent(busy.clone());
        self.store.commit(self.ledger.attach(batch, entry)).await?;

        claimed.version += 1;
        busy.version += 1;

        info!(
            task_id = %claimed.id,
            agent_id = %busy.id,
            complexity = claimed.complexity,
            "Task claimed"
        );

        Ok(Claim {
            task: claimed,
            agent: busy,
        })
    }

    /// Undo a claim whose workspace could not be provisioned.
    ///
    /// The task returns to `not_started` and the agent to `available`, with a
    /// note recording why. A cancellation queued during provisioning is
    /// honoured instead: the task ends `failed`.
    pub async fn rollback(&self, claim: &Claim, reason: &str) -> Result<Task, ClaimError> {
        let mut last_err = None;

        for _ in 0..RELEASE_ATTEMPTS {
            match self.try_rollback(claim, reason).await {
                Ok(task) => return Ok(task),
                Err(ClaimError::Conflict(msg)) => {
                    warn!(task_id = %claim.task.id, reason = %msg, "Rollback raced, re-reading");
                    last_err = Some(ClaimError::Conflict(msg));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| ClaimError::Conflict("rollback did not converge".into())))
    }

    async fn try_rollback(&self, claim: &Claim, reason: &str) -> Result<Task, ClaimError> {
        let task_id = &claim.task.id;
        let agent_id = &claim.agent.id;

        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;

        if task.assigned_agent_id.as_ref() != Some(agent_id) || !task.status.is_active() {
            // Already moved on (e.g. failed by a cancellation); nothing to undo.
            return Ok(task);
        }

        let now = Utc::now();
        let from = task.status;
        let cancelled = task.cancel_requested;

        task.assigned_agent_id = None;
        task.stage_progress = 0;
        task.cancel_requested = false;
        task.updated_at = now;
        let content = if cancelled {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            format!(
                "provisioning failed ({}); queued cancellation applied, {} -> failed",
                reason, from
            )
        } else {
            task.status = TaskStatus::NotStarted;
            format!(
                "provisioning failed ({}); claim by agent {} rolled back, {} -> not_started",
                reason, agent_id, from
            )
        };

        let mut batch = WriteBatch::new().update_task(task.clone());
        if let Some(agent) = released_agent(self.store.as_ref(), agent_id, task_id).await? {
            batch = batch.update_agent(agent);
        }
        let entry = TaskUpdate::note(task_id.clone(), Some(agent_id.clone()), content);
        self.store.commit(self.ledger.attach(batch, entry)).await?;
        task.version += 1;

        warn!(
            task_id = %task_id,
            agent_id = %agent_id,
            status = %task.status,
            reason = %reason,
            "Claim rolled back"
        );
        Ok(task)
    }
}

/// The agent record to write when `agent_id` gives up its claim on
/// `releasing`, or `None` if the agent keeps its current status.
///
/// A busy agent becomes available only when it holds no other active claim.
pub(crate) async fn released_agent(
    store: &dyn RecordStore,
    agent_id: &AgentId,
    releasing: &TaskId,
) -> Result<Option<Agent>, StoreError> {
    let Some(mut agent) = store.get_agent(agent_id).await? else {
        return Ok(None);
    };
    if agent.status != AgentStatus::Busy {
        return Ok(None);
    }

    let other_claims = store
        .list_tasks(&TaskFilter::assigned_to(agent_id.clone()))
        .await?
        .into_iter()
        .filter(|t| &t.id != releasing && t.status.is_active())
        .count();
    if other_claims > 0 {
        return Ok(None);
    }

    agent.status = AgentStatus::Available;
    Ok(Some(agent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use stagerun_core::{ComplexityRange, UpdateKind};

    async fn setup(complexity: u8, min: u8, max: u8) -> (ClaimCoordinator, Arc<dyn RecordStore>, TaskId, AgentId) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let task = Task::new("t", "", complexity);
        let agent = Agent::new("m", "http://a", ComplexityRange::new(min, max).unwrap());
        let ids = (task.id.clone(), agent.id.clone());
        store
            .commit(WriteBatch::new().insert_task(task).insert_agent(agent))
            .await
            .unwrap();
        let coordinator = ClaimCoordinator::new(store.clone(), AuditLedger::new(store.clone()));
        (coordinator, store, ids.0, ids.1)
    }

    #[tokio::test]
    async fn test_claim_sets_task_and_agent_together() {
        let (claims, store, task_id, agent_id) = setup(4, 1, 5).await;

        let claim = claims.claim(&task_id, &agent_id).await.unwrap();
        assert_eq!(claim.task.status, TaskStatus::Design);

        let task = store.get_task(&task_id).await.unwrap().unwrap();
        let agent = store.get_agent(&agent_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Design);
        assert_eq!(task.stage_progress, 0);
        assert_eq!(task.assigned_agent_id.as_ref(), Some(&agent_id));
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(task.version, claim.task.version);
        assert_eq!(agent.version, claim.agent.version);

        let history = store.list_updates(&task_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, UpdateKind::StatusChange);
    }

    #[tokio::test]
    async fn test_second_claim_on_same_task_conflicts() {
        let (claims, _store, task_id, agent_id) = setup(4, 1, 5).await;
        claims.claim(&task_id, &agent_id).await.unwrap();

        let err = claims.claim(&task_id, &agent_id).await.unwrap_err();
        assert!(matches!(err, ClaimError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_agent_is_ineligible() {
        let (claims, store, task_id, agent_id) = setup(9, 1, 5).await;

        let err = claims.claim(&task_id, &agent_id).await.unwrap_err();
        assert!(matches!(err, ClaimError::Ineligible { complexity: 9, .. }));
        let agent = store.get_agent(&agent_id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn test_rollback_restores_not_started_and_available() {
        let (claims, store, task_id, agent_id) = setup(4, 1, 5).await;
        let claim = claims.claim(&task_id, &agent_id).await.unwrap();

        let task = claims.rollback(&claim, "disk full").await.unwrap();
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert!(task.assigned_agent_id.is_none());

        let agent = store.get_agent(&agent_id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);

        let history = store.list_updates(&task_id).await.unwrap();
        assert_eq!(history.last().unwrap().kind, UpdateKind::Note);
        assert!(history.last().unwrap().content.contains("disk full"));
    }

    #[tokio::test]
    async fn test_rollback_honours_queued_cancellation() {
        let (claims, store, task_id, agent_id) = setup(4, 1, 5).await;
        let claim = claims.claim(&task_id, &agent_id).await.unwrap();

        let mut task = store.get_task(&task_id).await.unwrap().unwrap();
        task.cancel_requested = true;
        store.commit(WriteBatch::new().update_task(task)).await.unwrap();

        let task = claims.rollback(&claim, "timeout").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result_path.is_none());
        assert!(task.completed_at.is_some());
        let agent = store.get_agent(&agent_id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }
}
