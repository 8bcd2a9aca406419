//! HTTP request and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use stagerun_core::{AgentStatus, Task, TaskStatus, WorkspaceId, WorkspacePhase};

use crate::lifecycle::{AdvanceRequest, CancelOutcome};
use crate::service::ServiceError;

/// Query for `GET /v1/tasks`.
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
}

/// Body for `PUT /v1/tasks/:id/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AdvanceTaskRequest {
    pub status: TaskStatus,
    pub stage_progress: i32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result_path: Option<String>,
}

impl From<AdvanceTaskRequest> for AdvanceRequest {
    fn from(req: AdvanceTaskRequest) -> Self {
        Self {
            status: req.status,
            stage_progress: req.stage_progress,
            message: req.message,
            result_path: req.result_path,
        }
    }
}

/// Body for `POST /v1/tasks/:id/cancel`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CancelTaskRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response for `POST /v1/tasks/:id/cancel`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    /// True when the cancellation waits for provisioning to finish.
    pub queued: bool,
    pub task: Task,
}

impl From<CancelOutcome> for CancelTaskResponse {
    fn from(outcome: CancelOutcome) -> Self {
        match outcome {
            CancelOutcome::Cancelled(task) => Self {
                queued: false,
                task,
            },
            CancelOutcome::Queued(task) => Self { queued: true, task },
        }
    }
}

/// Body for `PUT /v1/agents/:id/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SetAgentStatusRequest {
    pub status: AgentStatus,
}

/// Query for `GET /v1/workspaces`.
#[derive(Debug, Default, Deserialize)]
pub struct ListWorkspacesQuery {
    pub phase: Option<WorkspacePhase>,
}

/// Response for `POST /v1/workspaces/purge`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub deleted: Vec<WorkspaceId>,
}

/// Body for `POST /v1/workspaces/:id/exec`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::InvalidTransition { .. } | Self::InvalidProgress(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::AgentBusy(_) | Self::WorkspaceActive(_) => {
                StatusCode::CONFLICT
            }
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExecutionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Provisioning(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, status = %status, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
