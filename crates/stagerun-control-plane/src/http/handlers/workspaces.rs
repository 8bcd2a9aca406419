//! Workspace handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use stagerun_core::WorkspaceId;

use crate::http::responses::{ExecRequest, ListWorkspacesQuery, PurgeResponse};
use crate::service::{ServiceError, WorkspaceService};
use crate::state::AppState;

pub async fn list_workspaces(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListWorkspacesQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let workspaces = WorkspaceService::new(state)
        .list_workspaces(query.phase)
        .await?;
    Ok(Json(workspaces))
}

pub async fn get_workspace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let workspace = WorkspaceService::new(state)
        .get_workspace(&WorkspaceId::new(id))
        .await?;
    Ok(Json(workspace))
}

/// Delete one archived workspace.
pub async fn delete_workspace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let workspace = WorkspaceService::new(state)
        .delete_workspace(&WorkspaceId::new(id))
        .await?;
    Ok(Json(workspace))
}

/// Apply the retention policy now.
pub async fn purge_workspaces(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ServiceError> {
    let deleted = WorkspaceService::new(state).purge_expired(Utc::now()).await?;
    Ok(Json(PurgeResponse { deleted }))
}

pub async fn exec_in_workspace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let output = WorkspaceService::new(state)
        .execute(
            &WorkspaceId::new(id),
            &req.command,
            req.timeout_secs.map(Duration::from_secs),
        )
        .await?;
    Ok(Json(output))
}
