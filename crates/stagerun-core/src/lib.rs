//! StageRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Storage
//! - Runtime specifics
//!
//! It also holds the two pieces of scheduling logic that are pure functions
//! of current state: agent matching and stage-transition planning.

pub mod agent;
pub mod error;
pub mod ids;
pub mod matcher;
pub mod status;
pub mod task;
pub mod transition;
pub mod update;
pub mod workspace;

// Re-export commonly used types
pub use agent::{Agent, ComplexityRange};
pub use error::CoreError;
pub use ids::{AgentId, TaskId, UpdateId, WorkspaceId};
pub use matcher::find_candidate;
pub use status::{AgentStatus, TaskStatus, UpdateKind, WorkspacePhase};
pub use task::{NewTask, Task, DEFAULT_PRIORITY};
pub use transition::{plan_transition, Transition};
pub use update::TaskUpdate;
pub use workspace::Workspace;
