//! # Recordflow
//!
//! Task orchestration and staged record pipelines for large record batches.
//!
//! A task names a topology and the records it applies to. Submitting the
//! task registers its progress record and publishes one envelope per record
//! to the first stage of the topology. Stage workers consume their topic
//! partition by partition, and every record ends in exactly one outcome:
//! processed, failed or deleted. The task finishes once all of its expected
//! records are accounted for.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use recordflow::{
//!     InMemoryQueue, RunnerBuilder, Task, TaskId, TaskInput, TaskStatusTracker, TaskSubmitter,
//!     Topology,
//! };
//!
//! let topology = Arc::new(
//!     Topology::new("validation")
//!         .start_with(ReadFileStage::new(content, RetryExecutor::default()))
//!         .then(ValidationStage::new(validator, RetryExecutor::default()))
//!         .build()?,
//! );
//!
//! let tracker = TaskStatusTracker::in_memory();
//! let queue = Arc::new(InMemoryQueue::new());
//!
//! let submitter = TaskSubmitter::new(tracker.clone(), queue.clone()).topology(topology.clone());
//! let runner = RunnerBuilder::new(queue, tracker.clone()).topology(topology).build();
//!
//! submitter.submit(&task).await?;
//! runner.drain().await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable SQLite-backed task, notification, queue and counter storage

pub mod config;
pub mod counter;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod locator;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod services;
pub mod stages;
pub mod step;
pub mod submission;
pub mod task;
pub mod tracker;

pub use config::{
    Backoff, BucketConfig, Config, ConfigError, IndexingConfig, MonitorConfig, RetryConfig,
    TopologyConfig, WorkerConfig,
};
pub use counter::{dataset_object_id, Bucket, BucketStore, BucketedCounter, InMemoryBucketStore};
pub use envelope::{params, HarvestDescriptor, RecordEnvelope, Revision};
pub use error::StoreError;
pub use hash::bucket_number;
pub use locator::RecordLocator;
pub use monitor::{MonitorBuilder, UnfinishedTaskMonitor};
pub use pipeline::{
    run_stage, Metadata, StageNode, Topology, TopologyBuilder, TopologyError, TopologyGraph,
};
pub use queue::{Delivery, InMemoryQueue, MessageId, MessageQueue};
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
pub use runner::{RunnerBuilder, StageWorker, TopologyRunner};
pub use services::{
    ContentStore, Depublisher, IndexingEngine, MetadataService, RunRegistry, Validator, Verdict,
};
pub use stages::{DepublishStage, IndexingStage, ReadFileStage, ValidationStage, WriteRecordStage};
pub use step::{Outcome, RecordError, Stage, StepError};
pub use submission::{
    DatasetRevisionSource, RecordSource, ResourceListSource, SourceRecord, Submission,
    SubmitError, TaskSubmitter,
};
pub use task::{DatasetInput, Task, TaskId, TaskInfo, TaskInput, TaskState, UNKNOWN_RECORD_COUNT};
pub use tracker::{
    InMemoryNotifications, InMemoryTaskInfoStore, Notification, NotificationSink, RecordState,
    TaskInfoStore, TaskStatusTracker,
};

#[cfg(feature = "sqlite")]
pub use counter::SqliteBucketStore;

#[cfg(feature = "sqlite")]
pub use queue::SqliteQueue;

#[cfg(feature = "sqlite")]
pub use tracker::{SqliteNotifications, SqliteTaskInfoStore};
