//! Task submission.
//!
//! Submitting a task registers its [`TaskInfo`], then publishes one envelope
//! per record to the entry topic of its topology. Records are spread over
//! partitions by routing key, so records of one object stay in order.

pub mod source;

pub use source::{DatasetRevisionSource, RecordSource, ResourceListSource, SourceRecord};

use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::envelope::{params, RecordEnvelope};
use crate::error::StoreError;
use crate::pipeline::Topology;
use crate::queue::MessageQueue;
use crate::retry::{RetryError, RetryExecutor};
use crate::step::StepError;
use crate::task::{Task, TaskId, TaskInfo, UNKNOWN_RECORD_COUNT};
use crate::tracker::TaskStatusTracker;

/// Error returned when a task cannot be submitted.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("unknown topology: {0}")]
    UnknownTopology(String),

    #[error("task {0} already exists; resubmit it with restart to replace it")]
    AlreadyExists(TaskId),

    /// The previous task could not be read. Not-found is not an error.
    #[error("cannot look up previous task {task_id}: {source}")]
    PreviousTaskLookup {
        task_id: TaskId,
        #[source]
        source: RetryError,
    },

    #[error("task tracker error: {0}")]
    Tracker(#[from] StoreError),

    #[error("cannot list records of task {task_id}: {source}")]
    Source {
        task_id: TaskId,
        #[source]
        source: StepError,
    },

    #[error("cannot publish records of task {task_id}: {source}")]
    Publish {
        task_id: TaskId,
        #[source]
        source: StoreError,
    },
}

/// Summary of an accepted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_id: TaskId,
    pub topic: String,
    pub published: u64,
    pub expected_records: i64,
}

/// Accepts tasks and feeds their records into topologies.
pub struct TaskSubmitter {
    tracker: TaskStatusTracker,
    queue: Arc<dyn MessageQueue>,
    topologies: HashMap<String, Arc<Topology>>,
    source: Arc<dyn RecordSource>,
    retry: RetryExecutor,
    owner: Option<String>,
}

impl TaskSubmitter {
    pub fn new(tracker: TaskStatusTracker, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            tracker,
            queue,
            topologies: HashMap::new(),
            source: Arc::new(ResourceListSource),
            retry: RetryExecutor::default(),
            owner: None,
        }
    }

    /// Register a topology tasks can be submitted to.
    pub fn topology(mut self, topology: Arc<Topology>) -> Self {
        self.topologies.insert(topology.name().to_string(), topology);
        self
    }

    /// Set where task records are read from.
    pub fn with_source(mut self, source: impl RecordSource + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    /// Set the retry executor for tracker lookups.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Record `owner` as the run processing submitted tasks.
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Records a chained task can expect: what its previous task forwarded.
    ///
    /// A missing, malformed or unknown previous task id gives
    /// [`UNKNOWN_RECORD_COUNT`]; only a failed lookup is an error.
    pub async fn expected_from_previous(&self, task: &Task) -> Result<i64, SubmitError> {
        let Some(raw) = task.parameter(params::PREVIOUS_TASK_ID) else {
            warn!(task_id = %task.id, "No previous task id, expected record count unknown");
            return Ok(UNKNOWN_RECORD_COUNT);
        };
        let Ok(previous) = raw.trim().parse::<i64>().map(TaskId) else {
            warn!(task_id = %task.id, previous = raw, "Malformed previous task id");
            return Ok(UNKNOWN_RECORD_COUNT);
        };

        let info = self
            .retry
            .execute(&format!("Error while reading task {previous}"), move || async move {
                self.tracker
                    .get_task_info(previous)
                    .await
                    .map_err(StepError::from)
            })
            .await
            .map_err(|source| SubmitError::PreviousTaskLookup {
                task_id: previous,
                source,
            })?;

        match info {
            Some(info) => Ok(info.forwarded_records()),
            None => {
                warn!(task_id = %task.id, %previous, "Previous task not found");
                Ok(UNKNOWN_RECORD_COUNT)
            }
        }
    }

    /// Submit a task.
    ///
    /// Nothing is published unless the task was registered. Once it is,
    /// a failure to list or publish its records fails the task.
    pub async fn submit(&self, task: &Task) -> Result<Submission, SubmitError> {
        let topology = self
            .topologies
            .get(&task.topology)
            .ok_or_else(|| SubmitError::UnknownTopology(task.topology.clone()))?;

        let expected = if topology.is_chained() {
            self.expected_from_previous(task).await?
        } else {
            UNKNOWN_RECORD_COUNT
        };

        let mut info = TaskInfo::new(task.id, topology.name(), expected);
        info.owner = self.owner.clone();
        match self.tracker.register(&info, task.restart).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => return Err(SubmitError::AlreadyExists(task.id)),
            Err(e) => return Err(e.into()),
        }
        self.tracker.start(task.id).await?;
        info!(
            task_id = %task.id,
            topology = topology.name(),
            expected,
            restart = task.restart,
            "Submitting task"
        );

        let published = match self.publish_records(task, topology).await {
            Ok(published) => published,
            Err(err) => {
                let reason = err.to_string();
                if let Err(e) = self.tracker.fail_task(task.id, &reason).await {
                    error!(task_id = %task.id, error = %e, "Cannot mark task failed");
                }
                return Err(err);
            }
        };

        let expected_records = if expected == UNKNOWN_RECORD_COUNT {
            published as i64
        } else {
            expected
        };
        // Completes a task whose records were all accounted for while publishing,
        // or that had none to publish.
        self.tracker
            .set_expected_records(task.id, expected_records)
            .await?;

        info!(task_id = %task.id, published, expected_records, "Task submitted");
        Ok(Submission {
            task_id: task.id,
            topic: topology.entry_topic(),
            published,
            expected_records,
        })
    }

    async fn publish_records(&self, task: &Task, topology: &Topology) -> Result<u64, SubmitError> {
        let topic = topology.entry_topic();
        let mut records = self.source.records(task);
        let mut published = 0u64;

        while let Some(record) = records
            .try_next()
            .await
            .map_err(|source| SubmitError::Source {
                task_id: task.id,
                source,
            })?
        {
            let mut envelope = RecordEnvelope::for_task(task, record.resource);
            if let Some(key) = record.routing_key {
                envelope.set_parameter(params::ROUTING_KEY, key);
            }
            if record.deleted {
                envelope.set_parameter(params::MARKED_DELETED, "true");
            }
            let partition = topology.partition_for(&envelope);
            self.queue
                .publish(&topic, partition, &envelope)
                .await
                .map_err(|source| SubmitError::Publish {
                    task_id: task.id,
                    source,
                })?;
            published += 1;
        }

        Ok(published)
    }
}
