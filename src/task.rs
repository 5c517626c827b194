//! Tasks and their tracked state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::envelope::{HarvestDescriptor, Revision};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dataset whose revisions make up a task's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInput {
    pub provider_id: String,
    pub dataset_id: String,
    pub representation_name: String,
    pub revision: Revision,
}

/// Where the records of a task come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInput {
    /// An explicit list of record locators.
    Resources(Vec<String>),
    /// Every record tagged with a revision in the given datasets.
    Datasets(Vec<DatasetInput>),
}

impl Default for TaskInput {
    fn default() -> Self {
        Self::Resources(Vec::new())
    }
}

/// A submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub topology: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub input: TaskInput,
    #[serde(default)]
    pub output_revision: Option<Revision>,
    #[serde(default)]
    pub harvesting: Option<HarvestDescriptor>,
    #[serde(default)]
    pub restart: bool,
}

impl Task {
    pub fn new(id: TaskId, name: impl Into<String>, topology: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            topology: topology.into(),
            parameters: HashMap::new(),
            input: TaskInput::default(),
            output_revision: None,
            harvesting: None,
            restart: false,
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_input(mut self, input: TaskInput) -> Self {
        self.input = input;
        self
    }

    pub fn with_output_revision(mut self, revision: Revision) -> Self {
        self.output_revision = Some(revision);
        self
    }

    pub fn restarted(mut self) -> Self {
        self.restart = true;
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// Lifecycle state of a task.
///
/// Transitions only move forward:
/// - Pending -> CurrentlyProcessing -> Processed
/// - Pending | CurrentlyProcessing -> Dropped
/// - Pending | CurrentlyProcessing -> Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    CurrentlyProcessing,
    Processed,
    Dropped,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::CurrentlyProcessing,
        TaskState::Processed,
        TaskState::Dropped,
        TaskState::Failed,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Dropped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::CurrentlyProcessing => "CURRENTLY_PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Dropped => "DROPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}

/// Expected record count when it cannot be determined.
pub const UNKNOWN_RECORD_COUNT: i64 = -1;

/// Durable progress record of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub topology_name: String,
    pub state: TaskState,
    pub state_description: String,
    pub owner: Option<String>,
    pub expected_records_number: i64,
    pub processed_records_count: i64,
    pub processed_errors_count: i64,
    pub deleted_records_count: i64,
    pub post_processed_records_count: i64,
    pub fatal_error: Option<String>,
    pub sent_timestamp: DateTime<Utc>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub finish_timestamp: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// A fresh record for a task that was just accepted.
    pub fn new(id: TaskId, topology_name: impl Into<String>, expected_records_number: i64) -> Self {
        Self {
            id,
            topology_name: topology_name.into(),
            state: TaskState::Pending,
            state_description: "The task is in a pending mode".to_string(),
            owner: None,
            expected_records_number,
            processed_records_count: 0,
            processed_errors_count: 0,
            deleted_records_count: 0,
            post_processed_records_count: 0,
            fatal_error: None,
            sent_timestamp: Utc::now(),
            start_timestamp: None,
            finish_timestamp: None,
        }
    }

    /// Records that reached a terminal outcome, errors included.
    pub fn finished_records(&self) -> i64 {
        self.processed_records_count
            + self.processed_errors_count
            + self.deleted_records_count
            + self.post_processed_records_count
    }

    /// Whether every expected record has been accounted for.
    pub fn all_records_accounted(&self) -> bool {
        self.expected_records_number >= 0 && self.finished_records() >= self.expected_records_number
    }

    /// Count a follow-up task can expect from this one.
    pub fn forwarded_records(&self) -> i64 {
        self.processed_records_count + self.deleted_records_count + self.post_processed_records_count
    }
}
