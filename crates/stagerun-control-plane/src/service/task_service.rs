//! Task operations.

use std::sync::Arc;

use tracing::info;

use stagerun_core::{CoreError, NewTask, Task, TaskId, TaskStatus, TaskUpdate};

use crate::lifecycle::{AdvanceRequest, CancelOutcome};
use crate::service::ServiceError;
use crate::state::AppState;
use crate::store::{TaskFilter, WriteBatch};

/// Task operations over the shared state.
#[derive(Clone)]
pub struct TaskService {
    state: Arc<AppState>,
}

impl TaskService {
    /// Create a new TaskService.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Validate and store a new `not_started` task, then wake the scheduler.
    pub async fn create_task(&self, request: NewTask) -> Result<Task, ServiceError> {
        let mut task = request.into_task()?;

        self.state
            .store
            .commit(WriteBatch::new().insert_task(task.clone()))
            .await?;
        task.version = 1;

        info!(
            task_id = %task.id,
            complexity = task.complexity,
            priority = task.priority,
            "Task created"
        );

        self.state.wake_scheduler();
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task, ServiceError> {
        self.state
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()).into())
    }

    /// List tasks, newest first.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ServiceError> {
        let filter = TaskFilter {
            status,
            ..TaskFilter::default()
        };
        let mut tasks = self.state.store.list_tasks(&filter).await?;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Report status/progress for a task.
    pub async fn advance(
        &self,
        task_id: &TaskId,
        request: AdvanceRequest,
    ) -> Result<Task, ServiceError> {
        let task = self.state.lifecycle.advance(task_id, request).await?;
        if task.is_terminal() {
            // The agent may be free again.
            self.state.wake_scheduler();
        }
        Ok(task)
    }

    /// Externally fail an active task.
    pub async fn cancel(&self, task_id: &TaskId, reason: &str) -> Result<CancelOutcome, ServiceError> {
        let outcome = self.state.lifecycle.cancel(task_id, reason).await?;
        if let CancelOutcome::Cancelled(_) = outcome {
            self.state.wake_scheduler();
        }
        Ok(outcome)
    }

    /// Ledger history for a task, oldest first.
    pub async fn updates(&self, task_id: &TaskId) -> Result<Vec<TaskUpdate>, ServiceError> {
        // 404 for unknown tasks rather than an empty list.
        self.get_task(task_id).await?;
        Ok(self.state.ledger.history(task_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryStore, RecordStore};

    fn service() -> TaskService {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        TaskService::new(AppState::new(Config::default(), store))
    }

    fn new_task(title: &str, complexity: u8, priority: Option<u8>) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: String::new(),
            complexity,
            priority,
        }
    }

    #[tokio::test]
    async fn test_create_task_defaults_priority() {
        let tasks = service();
        let task = tasks.create_task(new_task("Parser", 4, None)).await.unwrap();
        assert_eq!(task.priority, 5);
        assert_eq!(task.status, TaskStatus::NotStarted);

        let fetched = tasks.get_task(&task.id).await.unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn test_create_task_validation() {
        let tasks = service();
        for bad in [
            new_task("", 4, None),
            new_task("x", 0, None),
            new_task("x", 11, None),
            new_task("x", 4, Some(0)),
        ] {
            let err = tasks.create_task(bad).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidInput(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let tasks = service();
        tasks.create_task(new_task("a", 2, None)).await.unwrap();
        tasks.create_task(new_task("b", 2, None)).await.unwrap();

        assert_eq!(tasks.list_tasks(None).await.unwrap().len(), 2);
        assert_eq!(
            tasks.list_tasks(Some(TaskStatus::NotStarted)).await.unwrap().len(),
            2
        );
        assert!(tasks.list_tasks(Some(TaskStatus::Build)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let tasks = service();
        let err = tasks.updates(&TaskId::new("missing")).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_advance_not_started_is_rejected() {
        let tasks = service();
        let task = tasks.create_task(new_task("a", 2, None)).await.unwrap();

        let err = tasks
            .advance(&task.id, AdvanceRequest::new(TaskStatus::Design, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }));
    }
}
