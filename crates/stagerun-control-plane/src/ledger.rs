//! Audit ledger: append-only task history.
//!
//! Entries describing a state change are committed in the same batch as the
//! change itself, so the ledger never shows a transition that did not happen
//! (and vice versa). Standalone notes are appended on their own.

use std::sync::Arc;

use tracing::debug;

use stagerun_core::{TaskId, TaskUpdate};

use crate::store::{RecordStore, StoreError, WriteBatch};

/// Append-only history of task state changes.
#[derive(Clone)]
pub struct AuditLedger {
    store: Arc<dyn RecordStore>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Add `update` to a batch that carries the change it describes.
    pub fn attach(&self, batch: WriteBatch, update: TaskUpdate) -> WriteBatch {
        debug!(
            task_id = %update.task_id,
            kind = ?update.kind,
            content = %update.content,
            "Ledger entry staged"
        );
        batch.append(update)
    }

    /// Append a standalone entry.
    pub async fn record(&self, update: TaskUpdate) -> Result<(), StoreError> {
        let batch = self.attach(WriteBatch::new(), update);
        self.store.commit(batch).await
    }

    /// Full history of a task, oldest first.
    pub async fn history(&self, task_id: &TaskId) -> Result<Vec<TaskUpdate>, StoreError> {
        self.store.list_updates(task_id).await
    }
}
