//! Integration tests for the SQLite stores.

#![cfg(feature = "sqlite")]

use async_trait::async_trait;
use recordflow::{
    BucketedCounter, MessageQueue, Notification, NotificationSink, Outcome, RecordEnvelope,
    RecordError, RecordState, RunnerBuilder, SqliteBucketStore, SqliteNotifications, SqliteQueue,
    SqliteTaskInfoStore, Stage, StepError, StoreError, Task, TaskId, TaskInfo, TaskInput,
    TaskState, TaskStatusTracker, TaskSubmitter, Topology,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

async fn setup_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap()
}

async fn setup_tracker(pool: &SqlitePool) -> TaskStatusTracker {
    let store = SqliteTaskInfoStore::new(pool.clone());
    store.run_migrations().await.unwrap();
    let notifications = SqliteNotifications::new(pool.clone());
    notifications.run_migrations().await.unwrap();
    TaskStatusTracker::new(Arc::new(store), Arc::new(notifications))
}

async fn setup_queue(pool: &SqlitePool) -> SqliteQueue {
    let queue = SqliteQueue::new(pool.clone());
    queue.run_migrations().await.unwrap();
    queue
}

#[tokio::test]
async fn test_tracker_completes_task() {
    let pool = setup_pool().await;
    let tracker = setup_tracker(&pool).await;
    let id = TaskId(1);

    tracker
        .register(&TaskInfo::new(id, "validation", 3), false)
        .await
        .unwrap();
    assert!(tracker.start(id).await.unwrap());

    assert_eq!(tracker.record_processed(id).await.unwrap(), None);
    tracker
        .record_error(&RecordError {
            task_id: id,
            resource: "http://host/r/2".into(),
            message: "Document is not RDF".into(),
            additional_info: "line 1".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        tracker.record_deleted(id, "http://host/r/3").await.unwrap(),
        Some(TaskState::Processed)
    );

    let info = tracker.get_task_info(id).await.unwrap().unwrap();
    assert_eq!(info.state, TaskState::Processed);
    assert_eq!(info.processed_records_count, 1);
    assert_eq!(info.processed_errors_count, 1);
    assert_eq!(info.deleted_records_count, 1);
    assert!(info.start_timestamp.is_some());
    assert!(info.finish_timestamp.is_some());

    // Late outcomes do not touch a finished task
    assert_eq!(tracker.record_processed(id).await.unwrap(), None);
    let info = tracker.get_task_info(id).await.unwrap().unwrap();
    assert_eq!(info.processed_records_count, 1);

    let notifications = tracker.notifications().list_for_task(id).await.unwrap();
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0].state, RecordState::Error);
    assert_eq!(notifications[0].info_text, "Document is not RDF");
    assert_eq!(notifications[0].additional_info, "line 1");
    assert_eq!(notifications[1].state, RecordState::Deleted);
    assert_eq!(notifications[1].resource, "http://host/r/3");
}

#[tokio::test]
async fn test_tracker_fatal_error_fails_task_at_completion() {
    let pool = setup_pool().await;
    let tracker = setup_tracker(&pool).await;
    let id = TaskId(2);

    tracker
        .register(&TaskInfo::new(id, "validation", 2), false)
        .await
        .unwrap();
    tracker.start(id).await.unwrap();

    tracker.record_processed(id).await.unwrap();
    assert_eq!(tracker.record_fatal(id, "Revision could not be written").await.unwrap(), None);
    assert_eq!(
        tracker.record_processed(id).await.unwrap(),
        Some(TaskState::Failed)
    );

    let info = tracker.get_task_info(id).await.unwrap().unwrap();
    assert_eq!(info.fatal_error.as_deref(), Some("Revision could not be written"));
}

#[tokio::test]
async fn test_tracker_register_and_list() {
    let pool = setup_pool().await;
    let tracker = setup_tracker(&pool).await;

    let mut info = TaskInfo::new(TaskId(3), "indexing", -1);
    info.owner = Some("run-1".into());
    tracker.register(&info, false).await.unwrap();
    tracker
        .register(&TaskInfo::new(TaskId(4), "indexing", 5), false)
        .await
        .unwrap();
    tracker.start(TaskId(3)).await.unwrap();

    assert!(matches!(
        tracker.register(&info, false).await,
        Err(StoreError::AlreadyExists(_))
    ));

    let running = tracker
        .list_by_state(&[TaskState::CurrentlyProcessing])
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, TaskId(3));
    assert_eq!(running[0].owner.as_deref(), Some("run-1"));

    // Unknown expected count never completes
    tracker.record_processed(TaskId(3)).await.unwrap();
    let info = tracker.get_task_info(TaskId(3)).await.unwrap().unwrap();
    assert_eq!(info.state, TaskState::CurrentlyProcessing);

    tracker.set_expected_records(TaskId(3), 1).await.unwrap();
    let info = tracker.get_task_info(TaskId(3)).await.unwrap().unwrap();
    assert_eq!(info.state, TaskState::Processed);

    assert!(tracker.drop_task(TaskId(4), "Dropped by the user").await.unwrap());
    assert!(tracker.is_dropped(TaskId(4)).await.unwrap());
    assert!(!tracker.fail_task(TaskId(4), "too late").await.unwrap());
}

#[tokio::test]
async fn test_queue_claim_ack_and_recover() {
    let pool = setup_pool().await;
    let queue = setup_queue(&pool).await;

    let first = RecordEnvelope::new(TaskId(1), "t", "http://host/r/1");
    let second = RecordEnvelope::new(TaskId(1), "t", "http://host/r/2");
    let other = RecordEnvelope::new(TaskId(1), "t", "http://host/r/3");
    queue.publish("validation.read", 0, &first).await.unwrap();
    queue.publish("validation.read", 0, &second).await.unwrap();
    queue.publish("validation.read", 1, &other).await.unwrap();

    let claimed = queue.claim("validation.read", 0, 10).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].envelope, first);
    assert_eq!(claimed[1].envelope, second);
    assert_eq!(claimed[0].attempts, 1);

    // In-flight messages are not claimable
    assert!(queue.claim("validation.read", 0, 10).await.unwrap().is_empty());

    queue.ack(claimed[0].id).await.unwrap();
    assert_eq!(queue.outstanding("validation.read").await.unwrap(), 2);

    assert_eq!(queue.recover_in_flight("validation.read").await.unwrap(), 1);
    let redelivered = queue.claim("validation.read", 0, 10).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].envelope, second);
    assert_eq!(redelivered[0].attempts, 2);

    let other_partition = queue.claim("validation.read", 1, 10).await.unwrap();
    assert_eq!(other_partition.len(), 1);
    assert_eq!(other_partition[0].partition, 1);
}

#[tokio::test]
async fn test_queue_release_returns_message_to_pending() {
    let pool = setup_pool().await;
    let queue = setup_queue(&pool).await;

    let first = RecordEnvelope::new(TaskId(1), "t", "http://host/r/1");
    let second = RecordEnvelope::new(TaskId(1), "t", "http://host/r/2");
    queue.publish("validation.write", 0, &first).await.unwrap();
    queue.publish("validation.write", 0, &second).await.unwrap();

    let claimed = queue.claim("validation.write", 0, 1).await.unwrap();
    queue.release(claimed[0].id).await.unwrap();

    let again = queue.claim("validation.write", 0, 10).await.unwrap();
    assert_eq!(again.len(), 2);
    assert_eq!(again[0].envelope, first);
    assert_eq!(again[0].attempts, 2);
    assert_eq!(again[1].attempts, 1);
}

#[tokio::test]
async fn test_bucket_counter_rotates() {
    let pool = setup_pool().await;
    let store = SqliteBucketStore::new(pool.clone());
    store.run_migrations().await.unwrap();
    let counter = BucketedCounter::new(Arc::new(store), 2);

    let first = counter.add_row("provider_1dataset_1").await.unwrap();
    let second = counter.add_row("provider_1dataset_1").await.unwrap();
    let third = counter.add_row("provider_1dataset_1").await.unwrap();

    assert_eq!(first.bucket_id, second.bucket_id);
    assert_ne!(second.bucket_id, third.bucket_id);
    assert_eq!(counter.total("provider_1dataset_1").await.unwrap(), 3);

    let buckets = counter.buckets("provider_1dataset_1").await.unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].rows_count, 2);
    assert_eq!(buckets[1].rows_count, 1);
}

struct Uppercase;

#[async_trait]
impl Stage for Uppercase {
    fn name(&self) -> &'static str {
        "uppercase"
    }

    async fn process(&self, envelope: RecordEnvelope) -> Result<Outcome, StepError> {
        if envelope.resource.ends_with("bad") {
            return Ok(Outcome::error(&envelope, "Unsupported record", ""));
        }
        let upper = envelope.resource.to_uppercase();
        Ok(Outcome::Forward(envelope.with_payload(upper.into_bytes())))
    }
}

#[tokio::test]
async fn test_task_runs_on_sqlite_stores() {
    let pool = setup_pool().await;
    let tracker = setup_tracker(&pool).await;
    let queue = Arc::new(setup_queue(&pool).await);

    let topology = Arc::new(
        Topology::new("upper")
            .start_with(Uppercase)
            .partitions(3)
            .build()
            .unwrap(),
    );
    let submitter = TaskSubmitter::new(tracker.clone(), queue.clone()).topology(topology.clone());
    let runner = RunnerBuilder::new(queue.clone(), tracker.clone())
        .topology(topology)
        .batch_size(2)
        .build();

    let task = Task::new(TaskId(9), "upper", "upper").with_input(TaskInput::Resources(vec![
        "http://host/r/1".into(),
        "http://host/r/2".into(),
        "http://host/r/bad".into(),
        "http://host/r/4".into(),
    ]));
    submitter.submit(&task).await.unwrap();
    assert_eq!(runner.drain().await.unwrap(), 4);

    let info = tracker.get_task_info(TaskId(9)).await.unwrap().unwrap();
    assert_eq!(info.state, TaskState::Processed);
    assert_eq!(info.processed_records_count, 3);
    assert_eq!(info.processed_errors_count, 1);
    assert_eq!(runner.outstanding().await.unwrap(), 0);
}

/// Sink that rejects its first notification.
struct FlakyNotifications {
    inner: SqliteNotifications,
    failed: AtomicBool,
}

#[async_trait]
impl NotificationSink for FlakyNotifications {
    async fn notify(&self, notification: Notification) -> Result<(), StoreError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Storage("database is locked".into()));
        }
        self.inner.notify(notification).await
    }

    async fn list_for_task(&self, task_id: TaskId) -> Result<Vec<Notification>, StoreError> {
        self.inner.list_for_task(task_id).await
    }
}

#[tokio::test]
async fn test_failed_outcome_recording_is_redelivered() {
    let pool = setup_pool().await;
    let store = SqliteTaskInfoStore::new(pool.clone());
    store.run_migrations().await.unwrap();
    let notifications = SqliteNotifications::new(pool.clone());
    notifications.run_migrations().await.unwrap();
    let tracker = TaskStatusTracker::new(
        Arc::new(store),
        Arc::new(FlakyNotifications {
            inner: notifications,
            failed: AtomicBool::new(false),
        }),
    );
    let queue = Arc::new(setup_queue(&pool).await);

    let topology = Arc::new(Topology::new("upper").start_with(Uppercase).build().unwrap());
    let submitter = TaskSubmitter::new(tracker.clone(), queue.clone()).topology(topology.clone());
    let runner = RunnerBuilder::new(queue.clone(), tracker.clone())
        .topology(topology)
        .build();

    let task = Task::new(TaskId(10), "upper", "upper").with_input(TaskInput::Resources(vec![
        "http://host/r/1".into(),
        "http://host/r/bad".into(),
    ]));
    submitter.submit(&task).await.unwrap();
    runner.drain().await.unwrap();
    runner.drain().await.unwrap();

    let info = tracker.get_task_info(TaskId(10)).await.unwrap().unwrap();
    assert_eq!(info.state, TaskState::Processed);
    assert_eq!(info.processed_records_count, 1);
    assert_eq!(info.processed_errors_count, 1);
    assert_eq!(runner.outstanding().await.unwrap(), 0);
    assert_eq!(tracker.notifications().list_for_task(TaskId(10)).await.unwrap().len(), 1);
}
