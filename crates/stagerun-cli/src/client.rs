//! HTTP client for the control plane REST API.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use stagerun_core::{
    Agent, AgentStatus, NewTask, Task, TaskStatus, TaskUpdate, Workspace, WorkspaceId,
    WorkspacePhase,
};

/// Errors that can occur when talking to the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server rejected the request.
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Response of the cancel endpoint.
#[derive(Debug, Deserialize)]
pub struct CancelResponse {
    pub queued: bool,
    pub task: Task,
}

/// Body of the register endpoint.
#[derive(Debug, Serialize)]
pub struct RegisterAgentRequest {
    pub model: String,
    pub endpoint: String,
    pub min_complexity: u8,
    pub max_complexity: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
}

/// Body of the status endpoint.
#[derive(Debug, Serialize)]
pub struct AdvanceTaskRequest {
    pub status: TaskStatus,
    pub stage_progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PurgeResponse {
    deleted: Vec<WorkspaceId>,
}

/// HTTP client for REST API endpoints.
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client.
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn create_task(&self, task: &NewTask) -> Result<Task, ClientError> {
        self.send(Method::POST, "/v1/tasks", Some(task)).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ClientError> {
        let path = match status {
            Some(status) => format!("/v1/tasks?status={}", status),
            None => "/v1/tasks".to_string(),
        };
        self.get_json(&path).await
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, ClientError> {
        self.get_json(&format!("/v1/tasks/{}", id)).await
    }

    pub async fn advance(&self, id: &str, request: &AdvanceTaskRequest) -> Result<Task, ClientError> {
        self.send(Method::PUT, &format!("/v1/tasks/{}/status", id), Some(request))
            .await
    }

    pub async fn cancel_task(&self, id: &str, reason: Option<String>) -> Result<CancelResponse, ClientError> {
        let body = json!({ "reason": reason });
        self.send(Method::POST, &format!("/v1/tasks/{}/cancel", id), Some(&body))
            .await
    }

    pub async fn task_updates(&self, id: &str) -> Result<Vec<TaskUpdate>, ClientError> {
        self.get_json(&format!("/v1/tasks/{}/updates", id)).await
    }

    pub async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<Agent, ClientError> {
        self.send(Method::POST, "/v1/agents", Some(request)).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, ClientError> {
        self.get_json("/v1/agents").await
    }

    pub async fn heartbeat(&self, id: &str) -> Result<Agent, ClientError> {
        self.send::<Value, _>(Method::POST, &format!("/v1/agents/{}/heartbeat", id), None)
            .await
    }

    pub async fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<Agent, ClientError> {
        let body = json!({ "status": status });
        self.send(Method::PUT, &format!("/v1/agents/{}/status", id), Some(&body))
            .await
    }

    pub async fn list_workspaces(
        &self,
        phase: Option<WorkspacePhase>,
    ) -> Result<Vec<Workspace>, ClientError> {
        let path = match phase {
            Some(phase) => format!("/v1/workspaces?phase={}", phase),
            None => "/v1/workspaces".to_string(),
        };
        self.get_json(&path).await
    }

    pub async fn delete_workspace(&self, id: &str) -> Result<Workspace, ClientError> {
        self.send::<Value, _>(Method::DELETE, &format!("/v1/workspaces/{}", id), None)
            .await
    }

    pub async fn purge_workspaces(&self) -> Result<Vec<WorkspaceId>, ClientError> {
        let response: PurgeResponse = self
            .send::<Value, _>(Method::POST, "/v1/workspaces/purge", None)
            .await?;
        Ok(response.deleted)
    }

    /// Get JSON from an endpoint.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send::<Value, T>(Method::GET, path, None).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Request");

        let mut request = self.inner.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Serialization(e.to_string()))
    }
}

/// Turn an error response into a [`ClientError`], using the server's
/// `{"error": ...}` message when there is one.
fn api_error(status: u16, body: &str) -> ClientError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    if status == 404 {
        ClientError::NotFound(message)
    } else {
        ClientError::Api { status, message }
    }
}
