//! Shared application state.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::claim::ClaimCoordinator;
use crate::config::Config;
use crate::executor::{ShellExecutor, ToolExecutor};
use crate::ledger::AuditLedger;
use crate::lifecycle::LifecycleMachine;
use crate::provisioner::{Environment, WorkspaceProvisioner};
use crate::store::RecordStore;

/// Shared application state.
///
/// Holds no claim state of its own: everything durable lives in the store,
/// so several control planes can share one store.
pub struct AppState {
    /// Runtime configuration.
    pub config: Config,

    /// Record store every component reads and writes through.
    pub store: Arc<dyn RecordStore>,

    /// Task history.
    pub ledger: AuditLedger,

    /// Atomic task-to-agent binding.
    pub claims: ClaimCoordinator,

    /// Workspace creation, archival and deletion.
    pub provisioner: Arc<WorkspaceProvisioner>,

    /// Status transitions.
    pub lifecycle: LifecycleMachine,

    /// Runs commands inside workspaces.
    pub executor: Arc<dyn ToolExecutor>,

    /// Wakes the scheduler loop ahead of its next tick.
    pub wake: Arc<Notify>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(config: Config, store: Arc<dyn RecordStore>) -> Arc<Self> {
        let provisioner =
            WorkspaceProvisioner::new(store.clone(), &config.workspace_base, config.provision_timeout);
        Self::build(config, store, provisioner)
    }

    /// Create a new AppState with a custom workspace environment.
    pub fn with_environment(
        config: Config,
        store: Arc<dyn RecordStore>,
        environment: Arc<dyn Environment>,
    ) -> Arc<Self> {
        let provisioner =
            WorkspaceProvisioner::new(store.clone(), &config.workspace_base, config.provision_timeout)
                .with_environment(environment);
        Self::build(config, store, provisioner)
    }

    fn build(
        config: Config,
        store: Arc<dyn RecordStore>,
        provisioner: WorkspaceProvisioner,
    ) -> Arc<Self> {
        let ledger = AuditLedger::new(store.clone());
        let provisioner = Arc::new(provisioner);
        let claims = ClaimCoordinator::new(store.clone(), ledger.clone());
        let lifecycle = LifecycleMachine::new(store.clone(), ledger.clone(), provisioner.clone());
        let executor = Arc::new(ShellExecutor::new(&config.workspace_base));

        Arc::new(Self {
            config,
            store,
            ledger,
            claims,
            provisioner,
            lifecycle,
            executor,
            wake: Arc::new(Notify::new()),
        })
    }

    /// Ask the scheduler to run a tick now.
    pub fn wake_scheduler(&self) {
        self.wake.notify_one();
    }
}
