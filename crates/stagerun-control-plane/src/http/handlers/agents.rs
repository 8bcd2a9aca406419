//! Agent handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use stagerun_core::AgentId;

use crate::http::responses::SetAgentStatusRequest;
use crate::service::{AgentService, RegisterAgent, ServiceError};
use crate::state::AppState;

pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterAgent>,
) -> Result<impl IntoResponse, ServiceError> {
    let agent = AgentService::new(state).register_agent(req).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(AgentService::new(state).list_agents().await?))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let agent = AgentService::new(state).get_agent(&AgentId::new(id)).await?;
    Ok(Json(agent))
}

/// Set availability. Only `available` and `offline` are accepted.
pub async fn set_agent_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SetAgentStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let agent = AgentService::new(state)
        .set_availability(&AgentId::new(id), req.status)
        .await?;
    Ok(Json(agent))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let agent = AgentService::new(state).heartbeat(&AgentId::new(id)).await?;
    Ok(Json(agent))
}
