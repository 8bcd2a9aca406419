//! Service layer consumed by the REST transport.
//!
//! Every mutation here goes through the claim coordinator, the lifecycle
//! machine or the provisioner; none writes record fields directly.

use thiserror::Error;

use stagerun_core::{AgentId, CoreError, TaskStatus, WorkspaceId};

use crate::claim::ClaimError;
use crate::executor::ExecutionError;
use crate::lifecycle::LifecycleError;
use crate::provisioner::ProvisionError;
use crate::store::StoreError;

pub mod agent_service;
pub mod task_service;
pub mod workspace_service;

pub use agent_service::{AgentService, RegisterAgent};
pub use task_service::TaskService;
pub use workspace_service::WorkspaceService;

/// Client-facing error taxonomy.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("stage progress {0} outside 0..=100")]
    InvalidProgress(i32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("agent {0} holds an active claim")]
    AgentBusy(AgentId),

    #[error("workspace {0} is still active")]
    WorkspaceActive(WorkspaceId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for ServiceError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            CoreError::InvalidProgress(p) => Self::InvalidProgress(p),
            CoreError::InvalidInput(msg) => Self::InvalidInput(msg),
            CoreError::TaskNotFound(id) => Self::NotFound(format!("task {}", id)),
            CoreError::AgentNotFound(id) => Self::NotFound(format!("agent {}", id)),
            CoreError::WorkspaceNotFound(id) => Self::NotFound(format!("workspace {}", id)),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::VersionConflict { .. } | StoreError::Duplicate { .. } => {
                Self::Conflict(e.to_string())
            }
            StoreError::MissingRecord { kind, id } => Self::NotFound(format!("{} {}", kind, id)),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ClaimError> for ServiceError {
    fn from(e: ClaimError) -> Self {
        match e {
            ClaimError::Conflict(msg) => Self::Conflict(msg),
            ClaimError::Ineligible { .. } => Self::Conflict(e.to_string()),
            ClaimError::NotFound(e) => e.into(),
            ClaimError::Store(e) => e.into(),
        }
    }
}

impl From<LifecycleError> for ServiceError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Invalid(e) => e.into(),
            LifecycleError::Unassigned(_) => Self::Conflict(e.to_string()),
            LifecycleError::Conflict(_) => Self::Conflict(e.to_string()),
            LifecycleError::Store(e) => e.into(),
        }
    }
}

impl From<ProvisionError> for ServiceError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::NotFound(id) => Self::NotFound(format!("workspace {}", id)),
            ProvisionError::WorkspaceActive(id) => Self::WorkspaceActive(id),
            ProvisionError::Store(e) => e.into(),
            ProvisionError::Timeout(_) | ProvisionError::Io(_) => Self::Provisioning(e.to_string()),
        }
    }
}

impl From<ExecutionError> for ServiceError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Timeout(_) => Self::ExecutionTimeout(e.to_string()),
            ExecutionError::Security(msg) => Self::InvalidInput(msg),
            ExecutionError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_client_taxonomy() {
        let unavailable: ServiceError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(unavailable, ServiceError::StoreUnavailable(_)));

        let conflict: ServiceError = StoreError::VersionConflict {
            kind: "task",
            id: "t1".into(),
        }
        .into();
        assert!(matches!(conflict, ServiceError::Conflict(_)));

        let missing: ServiceError = StoreError::MissingRecord {
            kind: "agent",
            id: "a1".into(),
        }
        .into();
        assert!(matches!(missing, ServiceError::NotFound(ref m) if m == "agent a1"));
    }

    #[test]
    fn test_lifecycle_validation_is_surfaced() {
        let err: ServiceError = LifecycleError::Invalid(CoreError::InvalidTransition {
            from: TaskStatus::Design,
            to: TaskStatus::Test,
        })
        .into();
        assert!(matches!(
            err,
            ServiceError::InvalidTransition {
                from: TaskStatus::Design,
                to: TaskStatus::Test
            }
        ));
    }
}
