//! Basic usage example for recordflow.
//!
//! This example demonstrates:
//! - Building a topology from the provided stages (read, validate, write)
//! - Backing the tracker and the queue with SQLite
//! - Submitting a task and running its records through stage workers
//! - Watching for abandoned tasks with the unfinished task monitor
//!
//! Run with `RUST_LOG=recordflow=debug cargo run --example basic` for more detail.

use async_trait::async_trait;
use recordflow::services::{InMemoryContentStore, InMemoryMetadataService, LocalRunRegistry};
use recordflow::{
    params, Config, MonitorBuilder, NotificationSink, ReadFileStage, RetryExecutor, Revision,
    RunnerBuilder, SqliteNotifications, SqliteQueue, SqliteTaskInfoStore, StepError, Task, TaskId,
    TaskInput, TaskStatusTracker, TaskSubmitter, Topology, ValidationStage, Validator, Verdict,
    WriteRecordStage,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "topologies": [{ "name": "validation", "partitions": 4 }],
    "worker": { "poll_interval_ms": 50, "batch_size": 10 },
    "monitor": { "interval_secs": 30, "run_on_start": true }
}"#;

/// Accepts anything that looks like an RDF document.
struct RdfValidator;

#[async_trait]
impl Validator for RdfValidator {
    async fn validate(
        &self,
        content: &[u8],
        schema: &str,
        _version: Option<&str>,
    ) -> Result<Verdict, StepError> {
        if String::from_utf8_lossy(content).trim_start().starts_with("<rdf") {
            Ok(Verdict::Valid)
        } else {
            Ok(Verdict::Invalid {
                message: format!("Document does not match schema {schema}"),
                details: "expected an rdf root element".to_string(),
            })
        }
    }
}

fn file(cloud_id: &str) -> String {
    format!("http://files.local/records/{cloud_id}/representations/edm/versions/v1/files/{cloud_id}.xml")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("recordflow=info")),
        )
        .init();

    let config = Config::from_json_str(CONFIG)?;
    let retry = RetryExecutor::new(config.worker.retry.policy());

    // Stores
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await?;
    let task_store = SqliteTaskInfoStore::new(pool.clone());
    task_store.run_migrations().await?;
    let notifications = SqliteNotifications::new(pool.clone());
    notifications.run_migrations().await?;
    let queue = SqliteQueue::new(pool.clone());
    queue.run_migrations().await?;

    let tracker = TaskStatusTracker::new(Arc::new(task_store), Arc::new(notifications));
    let queue = Arc::new(queue);

    // External services
    let content = Arc::new(InMemoryContentStore::new());
    content.put(file("C1"), "<rdf:RDF>first</rdf:RDF>").await;
    content.put(file("C2"), "<html>not a record</html>").await;
    content.put(file("C3"), "<rdf:RDF>third</rdf:RDF>").await;
    let metadata = Arc::new(InMemoryMetadataService::new("http://store.local"));

    let topology_config = config
        .topology("validation")
        .ok_or_else(|| anyhow::anyhow!("validation topology is not configured"))?;
    let topology = Arc::new(
        Topology::from_config(topology_config)
            .start_with(ReadFileStage::new(content.clone(), retry.clone()))
            .desc("Fetch record content")
            .then(ValidationStage::new(Arc::new(RdfValidator), retry.clone()))
            .desc("Check records against their schema")
            .then(WriteRecordStage::new(metadata.clone(), retry.clone()))
            .desc("Store valid records as a new representation")
            .build()?,
    );
    println!("{}", serde_json::to_string_pretty(&topology.to_graph())?);

    let runner = RunnerBuilder::new(queue.clone(), tracker.clone())
        .topology(topology.clone())
        .config(&config.worker)
        .build();

    let registry = Arc::new(LocalRunRegistry::new());
    registry.register(runner.run_id()).await;
    let monitor = MonitorBuilder::new(tracker.clone(), registry)
        .config(&config.monitor)
        .build();
    tokio::spawn(async move { monitor.run().await });

    let submitter = TaskSubmitter::new(tracker.clone(), queue)
        .topology(topology)
        .owned_by(runner.run_id());

    let task = Task::new(TaskId(1), "validate_dataset", "validation")
        .with_parameter(params::SCHEMA_NAME, "edm")
        .with_parameter(params::NEW_REPRESENTATION_NAME, "edm_internal")
        .with_parameter(params::PROVIDER_ID, "provider_1")
        .with_parameter(params::OUTPUT_DATASET, "dataset_1")
        .with_output_revision(Revision::new("validated", "provider_1", chrono::Utc::now()))
        .with_input(TaskInput::Resources(vec![file("C1"), file("C2"), file("C3")]));

    let submission = submitter.submit(&task).await?;
    println!(
        "Submitted task {} with {} records to {}",
        submission.task_id, submission.published, submission.topic
    );

    let mut workers = runner.spawn();
    let info = loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(info) = tracker.get_task_info(task.id).await? {
            if info.state.is_terminal() {
                break info;
            }
        }
    };
    workers.abort_all();

    println!(
        "Task {} finished as {}: {} processed, {} errors, {} deleted",
        info.id,
        info.state,
        info.processed_records_count,
        info.processed_errors_count,
        info.deleted_records_count
    );
    for notification in tracker.notifications().list_for_task(task.id).await? {
        println!(
            "  {} {}: {}",
            notification.state.as_str(),
            notification.resource,
            notification.info_text
        );
    }
    println!("Versions written: {}", metadata.version_count().await);

    Ok(())
}
