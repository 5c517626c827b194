//! Task progress tracking.
//!
//! [`TaskStatusTracker`] is the only writer of task state. Pipeline workers
//! report one outcome per record; each report is an atomic counter bump
//! followed by a completion check, so concurrent workers never lose updates.

pub mod memory;
pub mod notification;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use memory::InMemoryTaskInfoStore;
pub use notification::{InMemoryNotifications, Notification, NotificationSink, RecordState};
pub use store::{Counter, TaskInfoStore, ACTIVE_STATES};

#[cfg(feature = "sqlite")]
pub use notification::SqliteNotifications;
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskInfoStore;

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::step::RecordError;
use crate::task::{TaskId, TaskInfo, TaskState};

/// Records per-record outcomes and derives task state from them.
#[derive(Clone)]
pub struct TaskStatusTracker {
    store: Arc<dyn TaskInfoStore>,
    notifications: Arc<dyn NotificationSink>,
}

impl TaskStatusTracker {
    pub fn new(store: Arc<dyn TaskInfoStore>, notifications: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// Tracker backed by process memory.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryTaskInfoStore::new()),
            Arc::new(InMemoryNotifications::new()),
        )
    }

    pub fn notifications(&self) -> &Arc<dyn NotificationSink> {
        &self.notifications
    }

    pub async fn get_task_info(&self, id: TaskId) -> Result<Option<TaskInfo>, StoreError> {
        self.store.find_by_id(id).await
    }

    pub async fn list_by_state(&self, states: &[TaskState]) -> Result<Vec<TaskInfo>, StoreError> {
        self.store.list_by_state(states).await
    }

    /// Store the initial record of a task.
    ///
    /// With `replace`, an existing record under the same id is overwritten.
    pub async fn register(&self, info: &TaskInfo, replace: bool) -> Result<(), StoreError> {
        if replace {
            self.store.upsert(info).await
        } else {
            self.store.insert(info).await
        }
    }

    /// Mark a pending task as running.
    pub async fn start(&self, id: TaskId) -> Result<bool, StoreError> {
        self.store
            .transition(
                id,
                &[TaskState::Pending],
                TaskState::CurrentlyProcessing,
                "The task is in progress",
            )
            .await
    }

    /// Set the expected count and re-check completion.
    pub async fn set_expected_records(&self, id: TaskId, expected: i64) -> Result<(), StoreError> {
        self.store.set_expected(id, expected).await?;
        self.evaluate(id).await?;
        Ok(())
    }

    pub async fn record_processed(&self, id: TaskId) -> Result<Option<TaskState>, StoreError> {
        self.bump(id, Counter::Processed).await
    }

    /// Publish the failure and count it against its task.
    pub async fn record_error(&self, err: &RecordError) -> Result<Option<TaskState>, StoreError> {
        debug!(task_id = %err.task_id, resource = %err.resource, error = %err.message, "Record failed");
        self.notifications.notify(Notification::error(err)).await?;
        self.bump(err.task_id, Counter::Errors).await
    }

    pub async fn record_deleted(
        &self,
        id: TaskId,
        resource: &str,
    ) -> Result<Option<TaskState>, StoreError> {
        self.notifications
            .notify(Notification::deleted(id, resource))
            .await?;
        self.bump(id, Counter::Deleted).await
    }

    pub async fn record_post_processed(&self, id: TaskId) -> Result<Option<TaskState>, StoreError> {
        self.bump(id, Counter::PostProcessed).await
    }

    /// Note a condition that prevents the task from succeeding.
    ///
    /// Processing continues; the task ends as failed once its records are
    /// accounted for.
    pub async fn record_fatal(&self, id: TaskId, reason: &str) -> Result<Option<TaskState>, StoreError> {
        warn!(task_id = %id, reason, "Fatal task condition recorded");
        self.store.record_fatal(id, reason).await?;
        self.evaluate(id).await
    }

    /// Cancel a task. In-flight records are not interrupted.
    pub async fn drop_task(&self, id: TaskId, reason: &str) -> Result<bool, StoreError> {
        let dropped = self
            .store
            .transition(id, ACTIVE_STATES, TaskState::Dropped, reason)
            .await?;
        if dropped {
            info!(task_id = %id, reason, "Task dropped");
        }
        Ok(dropped)
    }

    /// Fail a task immediately.
    pub async fn fail_task(&self, id: TaskId, reason: &str) -> Result<bool, StoreError> {
        let failed = self
            .store
            .transition(id, ACTIVE_STATES, TaskState::Failed, reason)
            .await?;
        if failed {
            warn!(task_id = %id, reason, "Task failed");
        }
        Ok(failed)
    }

    pub async fn is_dropped(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self
            .store
            .find_by_id(id)
            .await?
            .is_some_and(|t| t.state == TaskState::Dropped))
    }

    async fn bump(&self, id: TaskId, counter: Counter) -> Result<Option<TaskState>, StoreError> {
        if !self.store.increment(id, counter).await? {
            debug!(task_id = %id, ?counter, "Ignoring outcome for inactive task");
            return Ok(None);
        }
        self.evaluate(id).await
    }

    async fn evaluate(&self, id: TaskId) -> Result<Option<TaskState>, StoreError> {
        let finished = self.store.complete_if_finished(id).await?;
        if let Some(state) = finished {
            info!(task_id = %id, %state, "Task finished");
        }
        Ok(finished)
    }
}
