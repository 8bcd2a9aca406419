//! Scheduler loop - matches pending tasks to agents.
//!
//! Level-triggered: every tick re-reads `not_started` tasks from the store
//! and runs matcher, claim and provisioning for each. Nothing carries over
//! between ticks except per-task conflict counters used for auditing, so any
//! number of schedulers may run against the same store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stagerun_core::{find_candidate, AgentId, Task, TaskId, TaskStatus, TaskUpdate};

use crate::claim::{Claim, ClaimError};
use crate::lifecycle::LifecycleError;
use crate::provisioner::ProvisionError;
use crate::state::AppState;
use crate::store::{StoreError, TaskFilter};

/// Scheduler errors. Any of these aborts the current tick.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Claims that ended with a provisioned workspace.
    pub assigned: Vec<(TaskId, AgentId)>,
    /// Pending tasks with no eligible agent.
    pub unmatched: usize,
    /// Claims lost to another scheduler or a concurrent change.
    pub conflicts: usize,
    /// Claims rolled back because provisioning failed.
    pub provisioning_failures: usize,
    /// Queued cancellations applied after provisioning.
    pub cancelled: usize,
    /// Stranded claims (no workspace) that were rolled back.
    pub recovered: usize,
    /// Active workspaces left behind by finished tasks, now archived.
    pub archived: usize,
}

impl TickReport {
    /// True if the tick changed nothing.
    pub fn is_idle(&self) -> bool {
        self.assigned.is_empty()
            && self.conflicts == 0
            && self.provisioning_failures == 0
            && self.cancelled == 0
            && self.recovered == 0
            && self.archived == 0
    }
}

/// Task scheduler.
pub struct Scheduler {
    state: Arc<AppState>,
    conflict_counts: Mutex<HashMap<TaskId, u32>>,
}

impl Scheduler {
    /// Create a new Scheduler.
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            conflict_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Run one scheduling pass over all `not_started` tasks.
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport {
            recovered: self.recover_stranded_claims().await?,
            archived: self.archive_orphaned_workspaces().await?,
            ..TickReport::default()
        };

        let mut pending = self
            .state
            .store
            .list_tasks(&TaskFilter::with_status(TaskStatus::NotStarted))
            .await?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        for task in pending {
            self.schedule_task(&task, &mut report).await?;
        }

        Ok(report)
    }

    async fn schedule_task(
        &self,
        task: &Task,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let agents = self.state.store.list_agents().await?;
        let Some(agent) = find_candidate(task, &agents) else {
            debug!(task_id = %task.id, complexity = task.complexity, "No eligible agent");
            report.unmatched += 1;
            return Ok(());
        };

        let claim = match self.state.claims.claim(&task.id, &agent.id).await {
            Ok(claim) => claim,
            Err(ClaimError::Conflict(reason)) => {
                warn!(task_id = %task.id, agent_id = %agent.id, reason = %reason, "Claim conflict");
                report.conflicts += 1;
                self.note_conflict(&task.id, &agent.id).await?;
                return Ok(());
            }
            Err(ClaimError::Ineligible { .. }) => {
                // Agent's range changed after matching.
                report.conflicts += 1;
                self.note_conflict(&task.id, &agent.id).await?;
                return Ok(());
            }
            Err(ClaimError::NotFound(e)) => {
                debug!(task_id = %task.id, error = %e, "Claim target vanished");
                return Ok(());
            }
            Err(ClaimError::Store(e)) => return Err(e.into()),
        };
        self.clear_conflicts(&task.id);

        match self
            .state
            .provisioner
            .provision(&claim.agent, &claim.task)
            .await
        {
            Ok(workspace) => {
                info!(
                    task_id = %task.id,
                    agent_id = %claim.agent.id,
                    workspace_id = %workspace.id,
                    "Task assigned"
                );
                report
                    .assigned
                    .push((claim.task.id.clone(), claim.agent.id.clone()));
                if self.apply_queued_cancel(&task.id).await? {
                    report.cancelled += 1;
                }
            }
            Err(ProvisionError::Store(StoreError::Unavailable(reason))) => {
                // The claim stays; stranded-claim recovery picks it up later.
                return Err(StoreError::Unavailable(reason).into());
            }
            Err(e) => {
                report.provisioning_failures += 1;
                self.rollback(&claim, &e.to_string()).await?;
            }
        }

        Ok(())
    }

    async fn rollback(&self, claim: &Claim, reason: &str) -> Result<(), SchedulerError> {
        match self.state.claims.rollback(claim, reason).await {
            Ok(_) => Ok(()),
            Err(ClaimError::Store(e)) => Err(e.into()),
            Err(e) => {
                error!(task_id = %claim.task.id, agent_id = %claim.agent.id, error = %e, "Rollback failed");
                Ok(())
            }
        }
    }

    async fn apply_queued_cancel(&self, task_id: &TaskId) -> Result<bool, SchedulerError> {
        match self.state.lifecycle.apply_queued_cancel(task_id).await {
            Ok(applied) => Ok(applied.is_some()),
            Err(LifecycleError::Store(e)) => Err(e.into()),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Could not apply queued cancellation");
                Ok(false)
            }
        }
    }

    /// Roll back claims whose workspace never appeared, e.g. because the
    /// scheduler that made them stopped mid-provisioning.
    async fn recover_stranded_claims(&self) -> Result<usize, SchedulerError> {
        let grace = chrono::Duration::from_std(self.state.config.provision_timeout * 2)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - grace;

        let mut recovered = 0;
        for task in self.state.store.list_tasks(&TaskFilter::default()).await? {
            if !task.status.is_active() || task.updated_at > cutoff {
                continue;
            }
            let Some(agent_id) = task.assigned_agent_id.clone() else {
                continue;
            };
            if self.state.store.find_workspace(&agent_id, &task.id).await?.is_some() {
                continue;
            }
            let Some(agent) = self.state.store.get_agent(&agent_id).await? else {
                continue;
            };

            warn!(task_id = %task.id, agent_id = %agent_id, "Recovering stranded claim");
            let claim = Claim { task, agent };
            self.rollback(&claim, "workspace was never provisioned").await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Archive active workspaces whose task no longer holds a claim on the
    /// workspace's agent, e.g. after archival failed at task completion.
    async fn archive_orphaned_workspaces(&self) -> Result<usize, SchedulerError> {
        let mut archived = 0;
        for workspace in self.state.store.list_workspaces().await? {
            if !workspace.is_active() {
                continue;
            }
            let task = self.state.store.get_task(&workspace.task_id).await?;
            let claimed = task.is_some_and(|t| {
                t.status.is_active() && t.assigned_agent_id.as_ref() == Some(&workspace.agent_id)
            });
            if claimed {
                continue;
            }

            match self.state.provisioner.archive(&workspace.id).await {
                Ok(_) => {
                    warn!(
                        workspace_id = %workspace.id,
                        task_id = %workspace.task_id,
                        "Archived workspace left active by a finished task"
                    );
                    archived += 1;
                }
                Err(ProvisionError::Store(StoreError::Unavailable(reason))) => {
                    return Err(StoreError::Unavailable(reason).into());
                }
                Err(e) => {
                    error!(workspace_id = %workspace.id, error = %e, "Workspace archival failed");
                }
            }
        }
        Ok(archived)
    }

    async fn note_conflict(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<(), SchedulerError> {
        let count = {
            let mut counts = self
                .conflict_counts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let count = counts.entry(task_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if count < self.state.config.max_silent_conflicts {
            return Ok(());
        }

        let entry = TaskUpdate::note(
            task_id.clone(),
            None,
            format!(
                "claim lost {} times in a row (last candidate: agent {}); still re-matching",
                count, agent_id
            ),
        );
        match self.state.ledger.record(entry).await {
            Ok(()) => {
                self.clear_conflicts(task_id);
                Ok(())
            }
            Err(StoreError::MissingRecord { .. }) => {
                self.clear_conflicts(task_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn clear_conflicts(&self, task_id: &TaskId) {
        self.conflict_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(task_id);
    }

    /// Tick until `shutdown` fires. Wakes early on [`AppState::wake_scheduler`].
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval = ?self.state.config.tick_interval,
            "Scheduler started"
        );

        loop {
            let delay = match self.tick().await {
                Ok(report) => {
                    if !report.is_idle() {
                        info!(
                            assigned = report.assigned.len(),
                            unmatched = report.unmatched,
                            conflicts = report.conflicts,
                            provisioning_failures = report.provisioning_failures,
                            cancelled = report.cancelled,
                            recovered = report.recovered,
                            archived = report.archived,
                            "Scheduler tick"
                        );
                    }
                    if report.conflicts > 0 {
                        self.state.config.claim_backoff
                    } else {
                        self.state.config.tick_interval
                    }
                }
                Err(e) => {
                    error!(error = %e, "Scheduler tick aborted");
                    self.state.config.tick_interval
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.state.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Scheduler stopped");
    }
}
