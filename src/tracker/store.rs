//! Task info storage trait.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::task::{TaskId, TaskInfo, TaskState};

/// Per-task progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Processed,
    Errors,
    Deleted,
    PostProcessed,
}

impl Counter {
    /// Column backing this counter in SQL stores.
    pub fn column(self) -> &'static str {
        match self {
            Self::Processed => "processed_records",
            Self::Errors => "processed_errors",
            Self::Deleted => "deleted_records",
            Self::PostProcessed => "post_processed_records",
        }
    }
}

/// States in which counters still move.
pub const ACTIVE_STATES: &[TaskState] = &[TaskState::Pending, TaskState::CurrentlyProcessing];

pub(crate) const PROCESSED_DESCRIPTION: &str = "Completely processed";

/// Trait for task info storage backends.
///
/// Every mutation is a single atomic operation in the backend; callers never
/// read a row, change it and write it back.
#[async_trait]
pub trait TaskInfoStore: Send + Sync {
    /// Store a new task. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, info: &TaskInfo) -> Result<(), StoreError>;

    /// Store a task, replacing any previous row with the same id.
    async fn upsert(&self, info: &TaskInfo) -> Result<(), StoreError>;

    /// Look up a task. A missing task is `Ok(None)`.
    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskInfo>, StoreError>;

    /// All tasks currently in one of `states`, ordered by id.
    async fn list_by_state(&self, states: &[TaskState]) -> Result<Vec<TaskInfo>, StoreError>;

    /// Add one to `counter` if the task is still active.
    ///
    /// Returns false when the task is missing or already terminal.
    async fn increment(&self, id: TaskId, counter: Counter) -> Result<bool, StoreError>;

    /// Replace the expected record count.
    async fn set_expected(&self, id: TaskId, expected: i64) -> Result<(), StoreError>;

    /// Move the task to `to` if it is currently in one of `from`.
    ///
    /// Sets the start timestamp on entering `CurrentlyProcessing` and the
    /// finish timestamp on entering a terminal state. Returns whether the
    /// transition happened.
    async fn transition(
        &self,
        id: TaskId,
        from: &[TaskState],
        to: TaskState,
        description: &str,
    ) -> Result<bool, StoreError>;

    /// Remember that the task cannot finish successfully.
    ///
    /// The first reason wins. The state changes only when completion is
    /// next evaluated.
    async fn record_fatal(&self, id: TaskId, reason: &str) -> Result<(), StoreError>;

    /// Finish the task if every expected record is accounted for.
    ///
    /// Only a `CurrentlyProcessing` task with a known expected count moves.
    /// It becomes `Failed` if a fatal reason was recorded and `Processed`
    /// otherwise. Returns the new state when a transition happened.
    async fn complete_if_finished(&self, id: TaskId) -> Result<Option<TaskState>, StoreError>;
}
