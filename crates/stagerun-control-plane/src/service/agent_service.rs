//! Agent operations: registration, heartbeats and availability.
//!
//! Availability changes are compare-and-swap writes on the agent record. A
//! claim always bumps the agent's version, so an availability write racing a
//! claim loses with `Conflict` instead of overwriting `busy`.

use std::path::{Component, Path};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stagerun_core::{Agent, AgentId, AgentStatus, ComplexityRange, CoreError, TaskStatus};

use crate::lifecycle::{AdvanceRequest, LifecycleError};
use crate::service::ServiceError;
use crate::state::AppState;
use crate::store::{StoreError, TaskFilter, WriteBatch};

const HEARTBEAT_ATTEMPTS: usize = 3;

/// Request to register an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgent {
    pub model: String,
    pub endpoint: String,
    pub min_complexity: u8,
    pub max_complexity: u8,
    /// Relative directory under the workspace base. Defaults to the agent id.
    #[serde(default)]
    pub workspace_root: Option<String>,
}

/// Agent operations over the shared state.
#[derive(Clone)]
pub struct AgentService {
    state: Arc<AppState>,
}

impl AgentService {
    /// Create a new AgentService.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Register a new `available` agent.
    pub async fn register_agent(&self, request: RegisterAgent) -> Result<Agent, ServiceError> {
        if request.model.trim().is_empty() {
            return Err(ServiceError::InvalidInput("model is required".to_string()));
        }
        if request.endpoint.trim().is_empty() {
            return Err(ServiceError::InvalidInput("endpoint is required".to_string()));
        }
        let range = ComplexityRange::new(request.min_complexity, request.max_complexity)?;

        let mut agent = Agent::new(request.model, request.endpoint, range);
        if let Some(root) = request.workspace_root {
            validate_workspace_root(&root)?;
            agent = agent.with_workspace_root(root);
        }

        self.state
            .store
            .commit(WriteBatch::new().insert_agent(agent.clone()))
            .await?;
        agent.version = 1;

        info!(
            agent_id = %agent.id,
            model = %agent.model,
            min_complexity = agent.complexity_range.min,
            max_complexity = agent.complexity_range.max,
            "Agent registered"
        );

        self.state.wake_scheduler();
        Ok(agent)
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<Agent, ServiceError> {
        self.state
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()).into())
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, ServiceError> {
        let mut agents = self.state.store.list_agents().await?;
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(agents)
    }

    /// Record a health signal. An offline agent comes back as available.
    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<Agent, ServiceError> {
        let mut last_err = None;

        for _ in 0..HEARTBEAT_ATTEMPTS {
            let mut agent = self.get_agent(agent_id).await?;
            let revived = agent.status == AgentStatus::Offline;
            agent.last_heartbeat = Utc::now();
            if revived {
                agent.status = AgentStatus::Available;
            }

            match self
                .state
                .store
                .commit(WriteBatch::new().update_agent(agent.clone()))
                .await
            {
                Ok(()) => {
                    agent.version += 1;
                    if revived {
                        info!(agent_id = %agent.id, "Agent back online");
                        self.state.wake_scheduler();
                    }
                    return Ok(agent);
                }
                // A claim or release raced us; the heartbeat still applies.
                Err(e) if e.is_conflict() => last_err = Some(e),
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err
            .map(ServiceError::from)
            .unwrap_or_else(|| ServiceError::Conflict(agent_id.to_string())))
    }

    /// Mark an agent `available` or `offline`.
    ///
    /// `busy` is owned by the claim path and can't be set here, and an agent
    /// holding a claim can't change availability at all.
    pub async fn set_availability(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> Result<Agent, ServiceError> {
        if status == AgentStatus::Busy {
            return Err(ServiceError::InvalidInput(
                "busy is set by claims, not directly".to_string(),
            ));
        }

        let mut agent = self.get_agent(agent_id).await?;
        if agent.status == AgentStatus::Busy || self.holds_claim(agent_id).await? {
            return Err(ServiceError::AgentBusy(agent.id));
        }
        if agent.status == status {
            return Ok(agent);
        }

        agent.status = status;
        self.state
            .store
            .commit(WriteBatch::new().update_agent(agent.clone()))
            .await?;
        agent.version += 1;

        info!(agent_id = %agent.id, status = %agent.status, "Agent availability changed");
        if status == AgentStatus::Available {
            self.state.wake_scheduler();
        }
        Ok(agent)
    }

    /// Mark agents without a recent heartbeat offline. A busy stale agent has
    /// its task failed first, which releases the claim and archives the
    /// workspace.
    ///
    /// Returns the agents taken offline.
    pub async fn sweep_stale_agents(&self, now: DateTime<Utc>) -> Result<Vec<AgentId>, ServiceError> {
        let timeout = self.state.config.heartbeat_timeout;
        let mut offline = Vec::new();

        for agent in self.state.store.list_agents().await? {
            if agent.status == AgentStatus::Offline {
                continue;
            }
            let stale = (now - agent.last_heartbeat)
                .to_std()
                .map(|age| age > timeout)
                .unwrap_or(false);
            if !stale {
                continue;
            }

            warn!(
                agent_id = %agent.id,
                last_heartbeat = %agent.last_heartbeat,
                "Agent heartbeat lost"
            );

            if agent.status == AgentStatus::Busy && !self.fail_claims(&agent.id).await? {
                // Claim still provisioning; try again next sweep.
                continue;
            }

            match self.take_offline(&agent.id).await {
                Ok(true) => offline.push(agent.id),
                Ok(false) => {}
                Err(ServiceError::Conflict(reason)) => {
                    warn!(agent_id = %agent.id, reason = %reason, "Agent changed during sweep");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(offline)
    }

    /// Fail every active claim held by `agent_id`. Returns false if any claim
    /// could only be queued for cancellation.
    async fn fail_claims(&self, agent_id: &AgentId) -> Result<bool, ServiceError> {
        let claims = self
            .state
            .store
            .list_tasks(&TaskFilter::assigned_to(agent_id.clone()))
            .await?;

        let mut released = true;
        for task in claims.into_iter().filter(|t| t.status.is_active()) {
            let request = AdvanceRequest::new(TaskStatus::Failed, task.stage_progress as i32)
                .with_message(format!("agent {} stopped sending heartbeats", agent_id));
            match self.state.lifecycle.cancel(&task.id, "agent heartbeat lost").await {
                Ok(outcome) if outcome.task().is_terminal() => {}
                Ok(_) => released = false,
                Err(LifecycleError::Conflict(_)) => {
                    // Lost a race with a progress report; fail on the fresh copy.
                    let task = self.state.lifecycle.advance(&task.id, request).await?;
                    if !task.is_terminal() {
                        released = false;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(released)
    }

    async fn take_offline(&self, agent_id: &AgentId) -> Result<bool, ServiceError> {
        let mut agent = self.get_agent(agent_id).await?;
        if agent.status != AgentStatus::Available {
            return Ok(false);
        }
        agent.status = AgentStatus::Offline;
        self.state
            .store
            .commit(WriteBatch::new().update_agent(agent.clone()))
            .await?;
        info!(agent_id = %agent.id, "Agent marked offline");
        Ok(true)
    }

    async fn holds_claim(&self, agent_id: &AgentId) -> Result<bool, StoreError> {
        Ok(self
            .state
            .store
            .list_tasks(&TaskFilter::assigned_to(agent_id.clone()))
            .await?
            .iter()
            .any(|t| t.status.is_active()))
    }
}

/// Workspace roots are joined onto the workspace base, so they must stay
/// inside it.
fn validate_workspace_root(root: &str) -> Result<(), ServiceError> {
    let path = Path::new(root);
    let escapes = root.trim().is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ServiceError::InvalidInput(format!(
            "workspace_root must be a relative path inside the workspace base, got {:?}",
            root
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryStore, RecordStore};
    use stagerun_core::{Task, WorkspacePhase};
    use std::time::Duration;

    fn register(min: u8, max: u8) -> RegisterAgent {
        RegisterAgent {
            model: "claude".to_string(),
            endpoint: "http://agent:8080".to_string(),
            min_complexity: min,
            max_complexity: max,
            workspace_root: None,
        }
    }

    fn setup(dir: &Path) -> (AgentService, Arc<AppState>) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let config = Config {
            workspace_base: dir.to_path_buf(),
            heartbeat_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        let state = AppState::new(config, store);
        (AgentService::new(state.clone()), state)
    }

    async fn claimed_task(state: &Arc<AppState>, agent: &Agent) -> Task {
        let task = Task::new("t", "", agent.complexity_range.min);
        state
            .store
            .commit(WriteBatch::new().insert_task(task.clone()))
            .await
            .unwrap();
        let claim = state.claims.claim(&task.id, &agent.id).await.unwrap();
        state
            .provisioner
            .provision(&claim.agent, &claim.task)
            .await
            .unwrap();
        claim.task
    }

    #[tokio::test]
    async fn test_register_validates_range_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let (agents, _) = setup(dir.path());

        let agent = agents.register_agent(register(1, 5)).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        assert_eq!(agent.workspace_root, agent.id.as_str());

        assert!(matches!(
            agents.register_agent(register(6, 2)).await,
            Err(ServiceError::InvalidInput(_))
        ));
        let mut escaping = register(1, 5);
        escaping.workspace_root = Some("../etc".to_string());
        assert!(matches!(
            agents.register_agent(escaping).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_cannot_be_set_directly() {
        let dir = tempfile::tempdir().unwrap();
        let (agents, _) = setup(dir.path());
        let agent = agents.register_agent(register(1, 5)).await.unwrap();

        let err = agents
            .set_availability(&agent.id, AgentStatus::Busy)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_agent_with_claim_cannot_go_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (agents, state) = setup(dir.path());
        let agent = agents.register_agent(register(1, 5)).await.unwrap();
        claimed_task(&state, &agent).await;

        let err = agents
            .set_availability(&agent.id, AgentStatus::Offline)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AgentBusy(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_revives_offline_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (agents, _) = setup(dir.path());
        let agent = agents.register_agent(register(1, 5)).await.unwrap();
        agents
            .set_availability(&agent.id, AgentStatus::Offline)
            .await
            .unwrap();

        let agent = agents.heartbeat(&agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn test_sweep_fails_task_of_stale_busy_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (agents, state) = setup(dir.path());
        let agent = agents.register_agent(register(1, 5)).await.unwrap();
        let idle = agents.register_agent(register(1, 5)).await.unwrap();
        let task = claimed_task(&state, &agent).await;

        // Keep the idle agent fresh.
        let later = Utc::now() + chrono::Duration::seconds(60);
        let mut fresh = agents.get_agent(&idle.id).await.unwrap();
        fresh.last_heartbeat = later;
        state
            .store
            .commit(WriteBatch::new().update_agent(fresh))
            .await
            .unwrap();

        let offline = agents.sweep_stale_agents(later).await.unwrap();
        assert_eq!(offline, vec![agent.id.clone()]);

        let task = state.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.assigned_agent_id.is_none());

        let agent = agents.get_agent(&agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);

        let ws = state
            .store
            .find_workspace(&agent.id, &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ws.phase, WorkspacePhase::Archived);
        assert_eq!(
            agents.get_agent(&idle.id).await.unwrap().status,
            AgentStatus::Available
        );
    }
}
