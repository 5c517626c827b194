//! Topology runner that polls stage topics and dispatches to workers.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::worker::StageWorker;
use crate::config::WorkerConfig;
use crate::error::StoreError;
use crate::pipeline::Topology;
use crate::queue::MessageQueue;
use crate::tracker::TaskStatusTracker;

/// Runs a worker for every (stage, partition) of its topologies.
pub struct TopologyRunner {
    run_id: String,
    queue: Arc<dyn MessageQueue>,
    workers: Vec<Arc<StageWorker>>,
    topics: Vec<String>,
    poll_interval: Duration,
}

impl TopologyRunner {
    /// Identifier of this run, recorded as owner of the tasks it processes.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Make messages left in flight by a previous run claimable again.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for topic in &self.topics {
            recovered += self.queue.recover_in_flight(topic).await?;
        }
        if recovered > 0 {
            info!(run_id = %self.run_id, recovered, "Recovered in-flight messages");
        }
        Ok(recovered)
    }

    /// Poll every worker once, stages in topology order.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let mut handled = 0;
        for worker in &self.workers {
            handled += worker.poll_once().await?;
        }
        Ok(handled)
    }

    /// Poll until no worker finds anything to do.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let handled = self.poll_once().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }

    /// Messages not yet acknowledged on any of the runner's topics.
    pub async fn outstanding(&self) -> Result<usize, StoreError> {
        let mut outstanding = 0;
        for topic in &self.topics {
            outstanding += self.queue.outstanding(topic).await?;
        }
        Ok(outstanding)
    }

    /// Start one task per worker. Aborting the returned set stops them.
    pub fn spawn(&self) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            let poll_interval = self.poll_interval;
            tasks.spawn(async move {
                loop {
                    match worker.poll_once().await {
                        Ok(0) => tokio::time::sleep(poll_interval).await,
                        Ok(_) => {}
                        Err(e) => {
                            error!(
                                topic = worker.topic(),
                                partition = worker.partition(),
                                error = %e,
                                "Claim failed"
                            );
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            });
        }
        tasks
    }

    /// Recover in-flight messages, then run the workers indefinitely.
    pub async fn run(&self) -> ! {
        if let Err(e) = self.recover().await {
            error!(run_id = %self.run_id, error = %e, "Recovery failed");
        }
        info!(run_id = %self.run_id, workers = self.workers.len(), "Runner started");
        let _workers = self.spawn();
        loop {
            futures::future::pending::<()>().await;
        }
    }
}

/// Builder for constructing a TopologyRunner.
pub struct RunnerBuilder {
    queue: Arc<dyn MessageQueue>,
    tracker: TaskStatusTracker,
    topologies: Vec<Arc<Topology>>,
    run_id: Option<String>,
    poll_interval: Duration,
    batch_size: usize,
}

impl RunnerBuilder {
    /// Create a new builder with the given queue and tracker.
    pub fn new(queue: Arc<dyn MessageQueue>, tracker: TaskStatusTracker) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            queue,
            tracker,
            topologies: Vec::new(),
            run_id: None,
            poll_interval: defaults.poll_interval(),
            batch_size: defaults.batch_size,
        }
    }

    /// Register a topology with the runner.
    pub fn topology(mut self, topology: Arc<Topology>) -> Self {
        self.topologies.push(topology);
        self
    }

    /// Apply poll interval and batch size from configuration.
    pub fn config(self, config: &WorkerConfig) -> Self {
        self.poll_interval(config.poll_interval())
            .batch_size(config.batch_size)
    }

    /// Set how long an idle worker waits before polling again. Zero is raised to 1 ms.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set how many messages a worker claims at once.
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Set the run identifier. A random one is used otherwise.
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Build the runner.
    pub fn build(self) -> TopologyRunner {
        let mut workers = Vec::new();
        let mut topics = Vec::new();
        for topology in &self.topologies {
            for stage_index in 0..topology.stages().len() {
                for partition in 0..topology.partitions() {
                    if let Some(worker) = StageWorker::new(
                        topology.clone(),
                        stage_index,
                        partition,
                        self.queue.clone(),
                        self.tracker.clone(),
                        self.batch_size,
                    ) {
                        workers.push(Arc::new(worker));
                    }
                }
                topics.extend(topology.topic_for(stage_index));
            }
        }

        TopologyRunner {
            run_id: self
                .run_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            queue: self.queue,
            workers,
            topics,
            poll_interval: self.poll_interval,
        }
    }
}
