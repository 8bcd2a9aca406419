//! StageRun Control Plane Library
//!
//! Schedules tasks onto agents, drives them through their stages and manages
//! the workspace behind each assignment. All state lives in a
//! [`RecordStore`]; the components here only read it and commit atomic
//! batches to it.

pub mod claim;
pub mod config;
pub mod executor;
pub mod http;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod provisioner;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;

pub use claim::{Claim, ClaimCoordinator, ClaimError};
pub use config::{Args, Config};
pub use executor::{ExecutionError, ExecutionOutput, ShellExecutor, ToolExecutor};
pub use ledger::AuditLedger;
pub use lifecycle::{AdvanceRequest, CancelOutcome, LifecycleError, LifecycleMachine};
pub use provisioner::{
    Environment, FsEnvironment, ProvisionError, WorkspaceLayout, WorkspaceManifest,
    WorkspaceProvisioner,
};
pub use scheduler::{Scheduler, SchedulerError, TickReport};
pub use service::{AgentService, RegisterAgent, ServiceError, TaskService, WorkspaceService};
pub use state::AppState;
pub use store::{MemoryStore, RecordStore, StoreError, TaskFilter, WriteBatch};
