//! Control plane configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// StageRun control plane: schedules tasks onto agents and manages workspaces.
#[derive(Parser, Debug, Clone)]
#[command(name = "stagerun-control-plane", about = "StageRun control plane server")]
pub struct Args {
    /// HTTP server address
    #[arg(long, env = "STAGERUN_HTTP_ADDR", default_value = "127.0.0.1:50052")]
    pub http_addr: String,

    /// Base directory for agent workspaces
    #[arg(long, env = "STAGERUN_WORKSPACE_BASE", default_value = "workspaces")]
    pub workspace_base: PathBuf,

    /// JSON snapshot file for the record store (volatile when unset)
    #[arg(long, env = "STAGERUN_DATA_PATH")]
    pub data_path: Option<PathBuf>,

    /// Scheduler tick period in milliseconds
    #[arg(long, env = "STAGERUN_TICK_INTERVAL_MS", default_value = "2000")]
    pub tick_interval_ms: u64,

    /// Delay before re-matching after a claim conflict, in milliseconds
    #[arg(long, env = "STAGERUN_CLAIM_BACKOFF_MS", default_value = "250")]
    pub claim_backoff_ms: u64,

    /// Claim conflicts tolerated per task before an audit note is written
    #[arg(long, env = "STAGERUN_MAX_SILENT_CONFLICTS", default_value = "3")]
    pub max_silent_conflicts: u32,

    /// Workspace provisioning timeout in milliseconds
    #[arg(long, env = "STAGERUN_PROVISION_TIMEOUT_MS", default_value = "10000")]
    pub provision_timeout_ms: u64,

    /// Seconds an archived workspace is kept before it may be deleted
    #[arg(long, env = "STAGERUN_RETENTION_SECS", default_value = "604800")]
    pub retention_secs: u64,

    /// Seconds without a heartbeat before an agent is marked offline
    #[arg(long, env = "STAGERUN_HEARTBEAT_TIMEOUT_SECS", default_value = "45")]
    pub heartbeat_timeout_secs: u64,

    /// Default timeout for tool execution in workspaces, in seconds
    #[arg(long, env = "STAGERUN_EXEC_TIMEOUT_SECS", default_value = "120")]
    pub exec_timeout_secs: u64,
}

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub http_addr: String,

    /// Base directory relative agent workspace roots are resolved against.
    pub workspace_base: PathBuf,

    /// Snapshot file for the record store.
    pub data_path: Option<PathBuf>,

    /// Scheduler tick period when nothing wakes it earlier.
    pub tick_interval: Duration,

    /// Scheduler delay after a tick that lost claims to another instance.
    pub claim_backoff: Duration,

    /// Conflicts per task before the scheduler writes an audit note.
    pub max_silent_conflicts: u32,

    /// Upper bound on creating a workspace environment.
    pub provision_timeout: Duration,

    /// How long archived workspaces are retained.
    pub retention: Duration,

    /// Heartbeat staleness threshold.
    pub heartbeat_timeout: Duration,

    /// Default tool execution timeout.
    pub exec_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:50052".to_string(),
            workspace_base: PathBuf::from("workspaces"),
            data_path: None,
            tick_interval: Duration::from_millis(2000),
            claim_backoff: Duration::from_millis(250),
            max_silent_conflicts: 3,
            provision_timeout: Duration::from_secs(10),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            heartbeat_timeout: Duration::from_secs(45),
            exec_timeout: Duration::from_secs(120),
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            http_addr: args.http_addr,
            workspace_base: args.workspace_base,
            data_path: args.data_path,
            tick_interval: Duration::from_millis(args.tick_interval_ms),
            claim_backoff: Duration::from_millis(args.claim_backoff_ms),
            max_silent_conflicts: args.max_silent_conflicts,
            provision_timeout: Duration::from_millis(args.provision_timeout_ms),
            retention: Duration::from_secs(args.retention_secs),
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
            exec_timeout: Duration::from_secs(args.exec_timeout_secs),
        }
    }
}
