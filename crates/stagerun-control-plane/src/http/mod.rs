//! HTTP server for the control plane.
//!
//! Provides endpoints for:
//! - Tasks (`/v1/tasks`)
//! - Agents (`/v1/agents`)
//! - Workspaces (`/v1/workspaces`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Tasks
        .route(
            "/v1/tasks",
            post(handlers::create_task).get(handlers::list_tasks),
        )
        .route("/v1/tasks/:id", get(handlers::get_task))
        .route("/v1/tasks/:id/status", put(handlers::advance_task))
        .route("/v1/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/v1/tasks/:id/updates", get(handlers::task_updates))
        // Agents
        .route(
            "/v1/agents",
            post(handlers::register_agent).get(handlers::list_agents),
        )
        .route("/v1/agents/:id", get(handlers::get_agent))
        .route("/v1/agents/:id/status", put(handlers::set_agent_status))
        .route("/v1/agents/:id/heartbeat", post(handlers::heartbeat))
        // Workspaces
        .route("/v1/workspaces", get(handlers::list_workspaces))
        .route("/v1/workspaces/purge", post(handlers::purge_workspaces))
        .route(
            "/v1/workspaces/:id",
            get(handlers::get_workspace).delete(handlers::delete_workspace),
        )
        .route("/v1/workspaces/:id/exec", post(handlers::exec_in_workspace))
        // Observability
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
