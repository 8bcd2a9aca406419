//! HTTP request handlers.

mod agents;
mod health;
mod tasks;
mod workspaces;

pub use agents::{get_agent, heartbeat, list_agents, register_agent, set_agent_status};
pub use health::{health_check, metrics_handler};
pub use tasks::{advance_task, cancel_task, create_task, get_task, list_tasks, task_updates};
pub use workspaces::{
    delete_workspace, exec_in_workspace, get_workspace, list_workspaces, purge_workspaces,
};
