//! StageRun Control Plane Server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stagerun_control_plane::{
    http, AgentService, AppState, Args, Config, MemoryStore, RecordStore, Scheduler,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("stagerun=info".parse()?))
        .with_target(true)
        .init();

    let config = Config::from(args);
    let http_addr: SocketAddr = config.http_addr.parse()?;

    tokio::fs::create_dir_all(&config.workspace_base)
        .await
        .map_err(|e| {
            format!(
                "Failed to create workspace base '{}': {}",
                config.workspace_base.display(),
                e
            )
        })?;

    let store: Arc<dyn RecordStore> = match &config.data_path {
        Some(path) => {
            info!(path = %path.display(), "Loading record store snapshot");
            Arc::new(MemoryStore::open(path.clone()).await?)
        }
        None => {
            warn!("No data path configured - records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(config, store);
    let shutdown = CancellationToken::new();

    info!(
        http_addr = %http_addr,
        workspace_base = %state.config.workspace_base.display(),
        "Starting StageRun control plane"
    );

    // Scheduler loop
    let scheduler = Arc::new(Scheduler::new(state.clone()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    // Heartbeat sweep
    let sweep_task = tokio::spawn(run_heartbeat_sweep(state.clone(), shutdown.clone()));

    // HTTP server
    let router = http::create_router(state);
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    let server_shutdown = shutdown.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await;

    shutdown.cancel();
    if let Err(e) = result {
        error!(error = %e, "HTTP server error");
    }
    let (scheduler_result, sweep_result) = tokio::join!(scheduler_task, sweep_task);
    report_join("scheduler", scheduler_result);
    report_join("heartbeat sweep", sweep_result);

    info!("StageRun control plane stopped");
    Ok(())
}

/// Log a background task that panicked or was aborted. Returns true if it did.
fn report_join(task: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => false,
        Err(e) => {
            error!(task, error = %e, "Background task failed");
            true
        }
    }
}

/// Periodically take agents with stale heartbeats offline.
async fn run_heartbeat_sweep(state: Arc<AppState>, shutdown: CancellationToken) {
    let period = (state.config.heartbeat_timeout / 3).max(Duration::from_secs(1));
    let agents = AgentService::new(state);
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match agents.sweep_stale_agents(Utc::now()).await {
                    Ok(offline) if !offline.is_empty() => {
                        warn!(count = offline.len(), "Agents marked offline");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Heartbeat sweep failed"),
                }
            }
        }
    }
}
