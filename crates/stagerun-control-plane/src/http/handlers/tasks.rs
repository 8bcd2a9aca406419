//! Task handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use stagerun_core::{NewTask, TaskId};

use crate::http::responses::{
    AdvanceTaskRequest, CancelTaskRequest, CancelTaskResponse, ListTasksQuery,
};
use crate::service::{ServiceError, TaskService};
use crate::state::AppState;

/// Create a task. The scheduler picks it up on its next tick.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewTask>,
) -> Result<impl IntoResponse, ServiceError> {
    let task = TaskService::new(state).create_task(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let tasks = TaskService::new(state).list_tasks(query.status).await?;
    Ok(Json(tasks))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let task = TaskService::new(state).get_task(&TaskId::new(id)).await?;
    Ok(Json(task))
}

/// Report status and stage progress.
pub async fn advance_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AdvanceTaskRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let task = TaskService::new(state)
        .advance(&TaskId::new(id), req.into())
        .await?;
    Ok(Json(task))
}

/// Cancel an active task. Returns 202 when the cancellation is queued behind
/// provisioning.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelTaskRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "cancelled by request".to_string());
    let outcome = TaskService::new(state)
        .cancel(&TaskId::new(id), &reason)
        .await?;

    let response = CancelTaskResponse::from(outcome);
    let status = if response.queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

pub async fn task_updates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let updates = TaskService::new(state).updates(&TaskId::new(id)).await?;
    Ok(Json(updates))
}
