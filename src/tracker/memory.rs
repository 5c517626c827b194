//! In-memory implementation of TaskInfoStore.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::store::{Counter, TaskInfoStore, ACTIVE_STATES, PROCESSED_DESCRIPTION};
use crate::error::StoreError;
use crate::task::{TaskId, TaskInfo, TaskState};

/// Task info kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskInfoStore {
    tasks: Mutex<BTreeMap<TaskId, TaskInfo>>,
}

impl InMemoryTaskInfoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskInfoStore for InMemoryTaskInfoStore {
    async fn insert(&self, info: &TaskInfo) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&info.id) {
            return Err(StoreError::AlreadyExists(format!("task {}", info.id)));
        }
        tasks.insert(info.id, info.clone());
        Ok(())
    }

    async fn upsert(&self, info: &TaskInfo) -> Result<(), StoreError> {
        self.tasks.lock().await.insert(info.id, info.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskInfo>, StoreError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn list_by_state(&self, states: &[TaskState]) -> Result<Vec<TaskInfo>, StoreError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| states.contains(&t.state))
            .cloned()
            .collect())
    }

    async fn increment(&self, id: TaskId, counter: Counter) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let Some(info) = tasks.get_mut(&id).filter(|t| ACTIVE_STATES.contains(&t.state)) else {
            return Ok(false);
        };
        let field = match counter {
            Counter::Processed => &mut info.processed_records_count,
            Counter::Errors => &mut info.processed_errors_count,
            Counter::Deleted => &mut info.deleted_records_count,
            Counter::PostProcessed => &mut info.post_processed_records_count,
        };
        *field += 1;
        Ok(true)
    }

    async fn set_expected(&self, id: TaskId, expected: i64) -> Result<(), StoreError> {
        if let Some(info) = self.tasks.lock().await.get_mut(&id) {
            info.expected_records_number = expected;
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: TaskId,
        from: &[TaskState],
        to: TaskState,
        description: &str,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let Some(info) = tasks.get_mut(&id).filter(|t| from.contains(&t.state)) else {
            return Ok(false);
        };
        let now = Utc::now();
        info.state = to;
        info.state_description = description.to_string();
        if to == TaskState::CurrentlyProcessing && info.start_timestamp.is_none() {
            info.start_timestamp = Some(now);
        }
        if to.is_terminal() {
            info.finish_timestamp = Some(now);
        }
        Ok(true)
    }

    async fn record_fatal(&self, id: TaskId, reason: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        if let Some(info) = tasks.get_mut(&id).filter(|t| ACTIVE_STATES.contains(&t.state)) {
            info.fatal_error.get_or_insert_with(|| reason.to_string());
        }
        Ok(())
    }

    async fn complete_if_finished(&self, id: TaskId) -> Result<Option<TaskState>, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let Some(info) = tasks
            .get_mut(&id)
            .filter(|t| t.state == TaskState::CurrentlyProcessing && t.all_records_accounted())
        else {
            return Ok(None);
        };
        let (state, description) = match &info.fatal_error {
            Some(reason) => (TaskState::Failed, reason.clone()),
            None => (TaskState::Processed, PROCESSED_DESCRIPTION.to_string()),
        };
        info.state = state;
        info.state_description = description;
        info.finish_timestamp = Some(Utc::now());
        Ok(Some(state))
    }
}
