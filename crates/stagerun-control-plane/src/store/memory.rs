//! In-memory record store with optional JSON snapshot persistence.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use stagerun_core::{Agent, AgentId, Task, TaskId, TaskUpdate, Workspace, WorkspaceId};

use super::{RecordStore, StoreError, TaskFilter, WriteBatch, WriteOp};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    tasks: BTreeMap<TaskId, Task>,
    agents: BTreeMap<AgentId, Agent>,
    workspaces: BTreeMap<WorkspaceId, Workspace>,
    updates: Vec<TaskUpdate>,
    next_sequence: u64,
}

/// Record store holding all tables behind one lock.
///
/// With a snapshot path, every commit is first applied to a copy, written to
/// disk, and only then made visible, so a failed write leaves the previous
/// state intact.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty, volatile store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot_path: None,
            available: AtomicBool::new(true),
        }
    }

    /// Open a store backed by a JSON snapshot, loading it if present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let tables: Tables = serde_json::from_str(&raw)?;
                info!(
                    path = %path.display(),
                    tasks = tables.tasks.len(),
                    agents = tables.agents.len(),
                    "Loaded store snapshot"
                );
                tables
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
            available: AtomicBool::new(true),
        })
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_expected(
    kind: &'static str,
    id: &str,
    current: Option<u64>,
    expected: Option<u64>,
) -> Result<(), StoreError> {
    match (current, expected) {
        (None, None) => Ok(()),
        (Some(_), None) => Err(StoreError::Duplicate {
            kind,
            id: id.to_string(),
        }),
        (None, Some(_)) => Err(StoreError::MissingRecord {
            kind,
            id: id.to_string(),
        }),
        (Some(current), Some(expected)) if current == expected => Ok(()),
        (Some(_), Some(_)) => Err(StoreError::VersionConflict {
            kind,
            id: id.to_string(),
        }),
    }
}

fn missing(kind: &'static str, id: &str) -> StoreError {
    StoreError::MissingRecord {
        kind,
        id: id.to_string(),
    }
}

/// Check version expectations, unique keys and references for a batch.
fn validate(tables: &Tables, ops: &[WriteOp]) -> Result<(), StoreError> {
    let mut touched: HashSet<(&'static str, &str)> = HashSet::new();
    let mut new_tasks: HashSet<&TaskId> = HashSet::new();
    let mut new_agents: HashSet<&AgentId> = HashSet::new();
    let mut new_pairs: HashSet<(&AgentId, &TaskId)> = HashSet::new();

    for op in ops {
        match op {
            WriteOp::PutTask { record, expected } => {
                if !touched.insert(("task", record.id.as_str())) {
                    return Err(StoreError::InvalidBatch(format!(
                        "task {} written twice",
                        record.id
                    )));
                }
                let current = tables.tasks.get(&record.id).map(|t| t.version);
                check_expected("task", record.id.as_str(), current, *expected)?;
                if expected.is_none() {
                    new_tasks.insert(&record.id);
                }
            }
            WriteOp::PutAgent { record, expected } => {
                if !touched.insert(("agent", record.id.as_str())) {
                    return Err(StoreError::InvalidBatch(format!(
                        "agent {} written twice",
                        record.id
                    )));
                }
                let current = tables.agents.get(&record.id).map(|a| a.version);
                check_expected("agent", record.id.as_str(), current, *expected)?;
                if expected.is_none() {
                    new_agents.insert(&record.id);
                }
            }
            WriteOp::PutWorkspace { record, expected } => {
                if !touched.insert(("workspace", record.id.as_str())) {
                    return Err(StoreError::InvalidBatch(format!(
                        "workspace {} written twice",
                        record.id
                    )));
                }
                let current = tables.workspaces.get(&record.id).map(|w| w.version);
                check_expected("workspace", record.id.as_str(), current, *expected)?;
                if expected.is_none() {
                    let taken = tables
                        .workspaces
                        .values()
                        .any(|w| w.agent_id == record.agent_id && w.task_id == record.task_id);
                    if taken || !new_pairs.insert((&record.agent_id, &record.task_id)) {
                        return Err(StoreError::Duplicate {
                            kind: "workspace",
                            id: format!("{}/{}", record.agent_id, record.task_id),
                        });
                    }
                }
            }
            WriteOp::AppendUpdate(_) => {}
        }
    }

    let agent_exists = |id: &AgentId| tables.agents.contains_key(id) || new_agents.contains(id);
    let task_exists = |id: &TaskId| tables.tasks.contains_key(id) || new_tasks.contains(id);

    for op in ops {
        match op {
            WriteOp::PutTask { record, .. } => {
                if let Some(agent_id) = &record.assigned_agent_id {
                    if !agent_exists(agent_id) {
                        return Err(missing("agent", agent_id.as_str()));
                    }
                }
            }
            WriteOp::PutWorkspace { record, .. } => {
                if !agent_exists(&record.agent_id) {
                    return Err(missing("agent", record.agent_id.as_str()));
                }
                if !task_exists(&record.task_id) {
                    return Err(missing("task", record.task_id.as_str()));
                }
            }
            WriteOp::AppendUpdate(update) => {
                if !task_exists(&update.task_id) {
                    return Err(missing("task", update.task_id.as_str()));
                }
                if let Some(agent_id) = &update.agent_id {
                    if !agent_exists(agent_id) {
                        return Err(missing("agent", agent_id.as_str()));
                    }
                }
            }
            WriteOp::PutAgent { .. } => {}
        }
    }

    Ok(())
}

fn apply(tables: &mut Tables, ops: Vec<WriteOp>) {
    for op in ops {
        match op {
            WriteOp::PutTask {
                mut record,
                expected,
            } => {
                record.version = expected.map_or(1, |v| v + 1);
                tables.tasks.insert(record.id.clone(), record);
            }
            WriteOp::PutAgent {
                mut record,
                expected,
            } => {
                record.version = expected.map_or(1, |v| v + 1);
                tables.agents.insert(record.id.clone(), record);
            }
            WriteOp::PutWorkspace {
                mut record,
                expected,
            } => {
                record.version = expected.map_or(1, |v| v + 1);
                tables.workspaces.insert(record.id.clone(), record);
            }
            WriteOp::AppendUpdate(mut update) => {
                tables.next_sequence += 1;
                update.sequence = tables.next_sequence;
                tables.updates.push(update);
            }
        }
    }
}

async fn persist(path: &Path, tables: &Tables) -> Result<(), StoreError> {
    let raw = serde_json::to_vec_pretty(tables)?;
    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(&tmp, raw).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.ensure_available()?;
        Ok(self.tables.read().await.tasks.get(id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Option<Agent>, StoreError> {
        self.ensure_available()?;
        Ok(self.tables.read().await.agents.get(id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        self.ensure_available()?;
        Ok(self.tables.read().await.agents.values().cloned().collect())
    }

    async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        self.ensure_available()?;
        Ok(self.tables.read().await.workspaces.get(id).cloned())
    }

    async fn find_workspace(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
    ) -> Result<Option<Workspace>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .workspaces
            .values()
            .find(|w| &w.agent_id == agent_id && &w.task_id == task_id)
            .cloned())
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        self.ensure_available()?;
        Ok(self.tables.read().await.workspaces.values().cloned().collect())
    }

    async fn list_updates(&self, task_id: &TaskId) -> Result<Vec<TaskUpdate>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut updates: Vec<TaskUpdate> = tables
            .updates
            .iter()
            .filter(|u| &u.task_id == task_id)
            .cloned()
            .collect();
        updates.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        Ok(updates)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.ensure_available()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().await;
        validate(&tables, batch.ops())?;

        let ops = batch.into_ops();
        debug!(ops = ops.len(), "Committing write batch");

        match &self.snapshot_path {
            Some(path) => {
                let mut staged = tables.clone();
                apply(&mut staged, ops);
                persist(path, &staged).await?;
                *tables = staged;
            }
            None => apply(&mut tables, ops),
        }
        Ok(())
    }
}
