//! Prometheus metrics collection and formatting.
//!
//! Gauges are computed from the record store on each scrape.

use std::fmt::Write;
use std::sync::Arc;

use stagerun_core::{AgentStatus, TaskStatus, WorkspacePhase};

use crate::state::AppState;
use crate::store::{StoreError, TaskFilter};

/// Collect all metrics from the store and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> Result<String, StoreError> {
    let mut output = String::new();

    collect_task_metrics(state, &mut output).await?;
    collect_agent_metrics(state, &mut output).await?;
    collect_workspace_metrics(state, &mut output).await?;

    Ok(output)
}

/// Collect task metrics by status.
async fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) -> Result<(), StoreError> {
    let tasks = state.store.list_tasks(&TaskFilter::default()).await?;

    writeln!(output, "# HELP stagerun_tasks Number of tasks by status").ok();
    writeln!(output, "# TYPE stagerun_tasks gauge").ok();
    for status in TaskStatus::all() {
        let count = tasks.iter().filter(|t| t.status == *status).count();
        writeln!(output, "stagerun_tasks{{status=\"{status}\"}} {count}").ok();
    }

    let queued_cancellations = tasks.iter().filter(|t| t.cancel_requested).count();
    writeln!(
        output,
        "# HELP stagerun_tasks_cancel_queued Cancellations waiting for provisioning"
    )
    .ok();
    writeln!(output, "# TYPE stagerun_tasks_cancel_queued gauge").ok();
    writeln!(output, "stagerun_tasks_cancel_queued {queued_cancellations}").ok();

    Ok(())
}

/// Collect agent metrics by status.
async fn collect_agent_metrics(state: &Arc<AppState>, output: &mut String) -> Result<(), StoreError> {
    let agents = state.store.list_agents().await?;

    let mut available = 0u64;
    let mut busy = 0u64;
    let mut offline = 0u64;
    for agent in &agents {
        match agent.status {
            AgentStatus::Available => available += 1,
            AgentStatus::Busy => busy += 1,
            AgentStatus::Offline => offline += 1,
        }
    }

    writeln!(output, "# HELP stagerun_agents Number of registered agents by status").ok();
    writeln!(output, "# TYPE stagerun_agents gauge").ok();
    writeln!(output, "stagerun_agents{{status=\"available\"}} {available}").ok();
    writeln!(output, "stagerun_agents{{status=\"busy\"}} {busy}").ok();
    writeln!(output, "stagerun_agents{{status=\"offline\"}} {offline}").ok();

    Ok(())
}

/// Collect workspace metrics by phase.
async fn collect_workspace_metrics(
    state: &Arc<AppState>,
    output: &mut String,
) -> Result<(), StoreError> {
    let workspaces = state.store.list_workspaces().await?;

    let mut active = 0u64;
    let mut archived = 0u64;
    let mut deleted = 0u64;
    for workspace in &workspaces {
        match workspace.phase {
            WorkspacePhase::Active => active += 1,
            WorkspacePhase::Archived => archived += 1,
            WorkspacePhase::Deleted => deleted += 1,
        }
    }

    writeln!(output, "# HELP stagerun_workspaces Number of workspaces by phase").ok();
    writeln!(output, "# TYPE stagerun_workspaces gauge").ok();
    writeln!(output, "stagerun_workspaces{{phase=\"active\"}} {active}").ok();
    writeln!(output, "stagerun_workspaces{{phase=\"archived\"}} {archived}").ok();
    writeln!(output, "stagerun_workspaces{{phase=\"deleted\"}} {deleted}").ok();

    Ok(())
}
