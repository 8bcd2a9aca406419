//! StageRun CLI - Command line interface for the StageRun control plane.

mod client;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stagerun_core::{Agent, AgentStatus, NewTask, Task, TaskStatus, Workspace, WorkspacePhase};

use client::{AdvanceTaskRequest, HttpClient, RegisterAgentRequest};

/// StageRun CLI - Control plane management tool
#[derive(Parser, Debug)]
#[command(name = "stagerun")]
#[command(about = "CLI for the StageRun control plane", long_about = None)]
struct Cli {
    /// Control plane address
    #[arg(short, long, env = "STAGERUN_ADDR", default_value = "http://127.0.0.1:50052")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new task
    #[command(name = "create-task")]
    CreateTask {
        /// Short title
        #[arg(short, long)]
        title: String,

        /// Longer description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Complexity, 1-10
        #[arg(short, long)]
        complexity: u8,

        /// Priority, 1-10 (server default 5)
        #[arg(short, long)]
        priority: Option<u8>,
    },

    /// List tasks
    #[command(name = "list-tasks")]
    ListTasks {
        /// Only tasks in this status
        #[arg(short, long)]
        status: Option<TaskStatus>,
    },

    /// Get task details
    #[command(name = "get-task")]
    GetTask {
        /// Task ID
        id: String,
    },

    /// Report a task's status and stage progress
    Advance {
        /// Task ID
        id: String,

        /// Requested status (design, build, test, review, complete, failed)
        status: TaskStatus,

        /// Progress within the stage, 0-100
        #[arg(short = 'g', long, default_value = "0", allow_negative_numbers = true)]
        progress: i32,

        /// Message recorded in the task history
        #[arg(short, long)]
        message: Option<String>,

        /// Result location (only used on completion)
        #[arg(short, long)]
        result_path: Option<String>,
    },

    /// Cancel an active task
    #[command(name = "cancel-task")]
    CancelTask {
        /// Task ID
        id: String,

        /// Reason recorded in the task history
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Show a task's history
    Updates {
        /// Task ID
        id: String,
    },

    /// Register an agent
    #[command(name = "register-agent")]
    RegisterAgent {
        /// Model identifier
        #[arg(short, long)]
        model: String,

        /// Agent endpoint
        #[arg(short, long)]
        endpoint: String,

        /// Lowest complexity the agent accepts
        #[arg(long)]
        min: u8,

        /// Highest complexity the agent accepts
        #[arg(long)]
        max: u8,

        /// Workspace directory relative to the workspace base
        #[arg(short, long)]
        workspace_root: Option<String>,
    },

    /// List agents
    #[command(name = "list-agents")]
    ListAgents,

    /// Send a heartbeat for an agent
    Heartbeat {
        /// Agent ID
        id: String,
    },

    /// Mark an agent available or offline
    #[command(name = "set-agent-status")]
    SetAgentStatus {
        /// Agent ID
        id: String,

        /// available or offline
        status: AgentStatus,
    },

    /// List workspaces
    #[command(name = "list-workspaces")]
    ListWorkspaces {
        /// Only workspaces in this phase (active, archived, deleted)
        #[arg(short, long, value_parser = parse_phase)]
        phase: Option<WorkspacePhase>,
    },

    /// Delete one archived workspace
    #[command(name = "delete-workspace")]
    DeleteWorkspace {
        /// Workspace ID
        id: String,
    },

    /// Delete archived workspaces past their retention period
    #[command(name = "purge-workspaces")]
    PurgeWorkspaces,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = HttpClient::new(&cli.addr);

    match cli.command {
        Commands::CreateTask {
            title,
            description,
            complexity,
            priority,
        } => {
            let task = client
                .create_task(&NewTask {
                    title,
                    description,
                    complexity,
                    priority,
                })
                .await?;
            println!("Task created:");
            print_task(&task);
        }
        Commands::ListTasks { status } => {
            let tasks = client.list_tasks(status).await?;
            print_task_table(&tasks);
        }
        Commands::GetTask { id } => {
            print_task(&client.get_task(&id).await?);
        }
        Commands::Advance {
            id,
            status,
            progress,
            message,
            result_path,
        } => {
            let request = AdvanceTaskRequest {
                status,
                stage_progress: progress,
                message,
                result_path,
            };
            let task = client.advance(&id, &request).await?;
            print_task(&task);
        }
        Commands::CancelTask { id, reason } => {
            let response = client.cancel_task(&id, reason).await?;
            if response.queued {
                println!("Cancellation queued until the workspace is ready:");
            } else {
                println!("Task cancelled:");
            }
            print_task(&response.task);
        }
        Commands::Updates { id } => {
            let updates = client.task_updates(&id).await?;
            println!("Updates ({}):", updates.len());
            println!("{:<20}  {:<16}  {}", "TIME", "KIND", "CONTENT");
            println!("{}", "-".repeat(80));
            for update in updates {
                let kind = serde_json::to_value(update.kind)?
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                println!(
                    "{:<20}  {:<16}  {}",
                    format_timestamp(update.timestamp),
                    kind,
                    update.content
                );
            }
        }
        Commands::RegisterAgent {
            model,
            endpoint,
            min,
            max,
            workspace_root,
        } => {
            let agent = client
                .register_agent(&RegisterAgentRequest {
                    model,
                    endpoint,
                    min_complexity: min,
                    max_complexity: max,
                    workspace_root,
                })
                .await?;
            println!("Agent registered:");
            print_agent(&agent);
        }
        Commands::ListAgents => {
            let agents = client.list_agents().await?;
            println!("Agents ({}):", agents.len());
            println!(
                "{:<36}  {:<10}  {:<7}  {:<16}  {}",
                "ID", "STATUS", "RANGE", "MODEL", "LAST ACTIVE"
            );
            println!("{}", "-".repeat(90));
            for agent in agents {
                let range = format!("{}-{}", agent.complexity_range.min, agent.complexity_range.max);
                println!(
                    "{:<36}  {:<10}  {:<7}  {:<16}  {}",
                    agent.id,
                    agent.status,
                    range,
                    agent.model,
                    format_timestamp(agent.last_active)
                );
            }
        }
        Commands::Heartbeat { id } => {
            let agent = client.heartbeat(&id).await?;
            println!("Heartbeat recorded, agent is {}", agent.status);
        }
        Commands::SetAgentStatus { id, status } => {
            let agent = client.set_agent_status(&id, status).await?;
            print_agent(&agent);
        }
        Commands::ListWorkspaces { phase } => {
            let workspaces = client.list_workspaces(phase).await?;
            print_workspace_table(&workspaces);
        }
        Commands::DeleteWorkspace { id } => {
            let workspace = client.delete_workspace(&id).await?;
            println!("Workspace {} deleted ({})", workspace.id, workspace.root_path.display());
        }
        Commands::PurgeWorkspaces => {
            let deleted = client.purge_workspaces().await?;
            println!("Purged {} workspace(s)", deleted.len());
            for id in deleted {
                println!("  {}", id);
            }
        }
    }

    Ok(())
}

fn parse_phase(s: &str) -> Result<WorkspacePhase, String> {
    match s {
        "active" => Ok(WorkspacePhase::Active),
        "archived" => Ok(WorkspacePhase::Archived),
        "deleted" => Ok(WorkspacePhase::Deleted),
        other => Err(format!("unknown workspace phase: {}", other)),
    }
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Title:      {}", task.title);
    println!("  Status:     {} ({}%)", task.status, task.stage_progress);
    println!("  Complexity: {}", task.complexity);
    println!("  Priority:   {}", task.priority);
    if let Some(agent_id) = &task.assigned_agent_id {
        println!("  Agent:      {}", agent_id);
    }
    if task.cancel_requested {
        println!("  Cancel:     queued");
    }
    if let Some(path) = &task.result_path {
        println!("  Result:     {}", path);
    }
    println!("  Created:    {}", format_timestamp(task.created_at));
    if let Some(completed) = task.completed_at {
        println!("  Completed:  {}", format_timestamp(completed));
    }
}

fn print_task_table(tasks: &[Task]) {
    println!("Tasks ({}):", tasks.len());
    println!(
        "{:<36}  {:<12}  {:>4}  {:>3}  {:<36}  {}",
        "ID", "STATUS", "PROG", "PRI", "AGENT", "TITLE"
    );
    println!("{}", "-".repeat(110));
    for task in tasks {
        let agent = task
            .assigned_agent_id
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<12}  {:>3}%  {:>3}  {:<36}  {}",
            task.id, task.status, task.stage_progress, task.priority, agent, task.title
        );
    }
}

fn print_agent(agent: &Agent) {
    println!("  ID:         {}", agent.id);
    println!("  Model:      {}", agent.model);
    println!("  Endpoint:   {}", agent.endpoint);
    println!("  Status:     {}", agent.status);
    println!(
        "  Range:      {}-{}",
        agent.complexity_range.min, agent.complexity_range.max
    );
    println!("  Workspace:  {}", agent.workspace_root);
    println!("  Heartbeat:  {}", format_timestamp(agent.last_heartbeat));
}

fn print_workspace_table(workspaces: &[Workspace]) {
    println!("Workspaces ({}):", workspaces.len());
    println!(
        "{:<36}  {:<9}  {:<36}  {}",
        "ID", "PHASE", "TASK", "ROOT"
    );
    println!("{}", "-".repeat(110));
    for ws in workspaces {
        println!(
            "{:<36}  {:<9}  {:<36}  {}",
            ws.id,
            ws.phase,
            ws.task_id,
            ws.root_path.display()
        );
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_advance() {
        let cli = Cli::try_parse_from([
            "stagerun", "advance", "t1", "build", "--progress", "40", "-m", "halfway",
        ])
        .unwrap();
        match cli.command {
            Commands::Advance {
                id,
                status,
                progress,
                message,
                result_path,
            } => {
                assert_eq!(id, "t1");
                assert_eq!(status, TaskStatus::Build);
                assert_eq!(progress, 40);
                assert_eq!(message.as_deref(), Some("halfway"));
                assert!(result_path.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_agent_status_and_phase() {
        let cli =
            Cli::try_parse_from(["stagerun", "set-agent-status", "a1", "offline"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::SetAgentStatus { status: AgentStatus::Offline, .. }
        ));

        let cli =
            Cli::try_parse_from(["stagerun", "list-workspaces", "--phase", "archived"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::ListWorkspaces { phase: Some(WorkspacePhase::Archived) }
        ));

        assert!(Cli::try_parse_from(["stagerun", "list-tasks", "--status", "bogus"]).is_err());
    }
}
