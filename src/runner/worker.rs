//! Worker consuming one partition of one stage topic.

use std::sync::Arc;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::pipeline::{run_stage, Topology};
use crate::queue::{Delivery, MessageQueue};
use crate::step::Outcome;
use crate::tracker::TaskStatusTracker;

/// Runs one stage over the messages of one partition.
///
/// A message is acknowledged only after its outcome was recorded: published
/// to the next stage, or counted by the tracker. Failing to record it, or a
/// crash in between, leads to redelivery.
pub struct StageWorker {
    topology: Arc<Topology>,
    stage_index: usize,
    partition: u32,
    topic: String,
    next_topic: Option<String>,
    queue: Arc<dyn MessageQueue>,
    tracker: TaskStatusTracker,
    batch_size: usize,
}

impl StageWorker {
    /// Worker for the stage at `stage_index`, or `None` if there is none.
    pub fn new(
        topology: Arc<Topology>,
        stage_index: usize,
        partition: u32,
        queue: Arc<dyn MessageQueue>,
        tracker: TaskStatusTracker,
        batch_size: usize,
    ) -> Option<Self> {
        let topic = topology.topic_for(stage_index)?;
        let next_topic = topology.topic_for(stage_index + 1);
        Some(Self {
            topology,
            stage_index,
            partition,
            topic,
            next_topic,
            queue,
            tracker,
            batch_size: batch_size.max(1),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Claim one batch and handle it. Returns the number of messages acknowledged.
    ///
    /// A message whose outcome cannot be recorded is released, so a later
    /// poll delivers it again.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let deliveries = self
            .queue
            .claim(&self.topic, self.partition, self.batch_size)
            .await?;

        let mut acked = 0;
        for delivery in deliveries {
            let id = delivery.id;
            match self.handle(delivery).await {
                Ok(()) => acked += 1,
                Err(e) => {
                    error!(
                        topic = %self.topic,
                        partition = self.partition,
                        message_id = id.0,
                        error = %e,
                        "Cannot record outcome, releasing message"
                    );
                    if let Err(e) = self.queue.release(id).await {
                        error!(message_id = id.0, error = %e, "Cannot release message");
                    }
                }
            }
        }
        Ok(acked)
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), StoreError> {
        let envelope = delivery.envelope;
        let task_id = envelope.task_id;

        if self.tracker.is_dropped(task_id).await? {
            debug!(task_id = %task_id, resource = %envelope.resource, "Skipping record of dropped task");
            return self.queue.ack(delivery.id).await;
        }

        let stage = &self.topology.stages()[self.stage_index];
        match run_stage(stage.as_ref(), envelope).await {
            Outcome::Forward(envelope) => match &self.next_topic {
                Some(next) => {
                    let partition = self.topology.partition_for(&envelope);
                    self.queue.publish(next, partition, &envelope).await?;
                }
                None => {
                    self.tracker.record_processed(task_id).await?;
                }
            },
            Outcome::Error(err) => {
                self.tracker.record_error(&err).await?;
            }
            Outcome::Drop { task_id, resource } => {
                self.tracker.record_deleted(task_id, &resource).await?;
            }
        }

        self.queue.ack(delivery.id).await
    }
}
