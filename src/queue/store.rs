//! Message queue trait and types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::envelope::RecordEnvelope;
use crate::error::StoreError;

/// Unique identifier for a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i64);

/// A claimed message. It stays in flight until acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub topic: String,
    pub partition: u32,
    pub envelope: RecordEnvelope,
    /// How many times this message has been claimed, this claim included.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Trait for partitioned, at-least-once message queues.
///
/// Messages of one (topic, partition) are claimed in publish order.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append an envelope to a partition.
    async fn publish(
        &self,
        topic: &str,
        partition: u32,
        envelope: &RecordEnvelope,
    ) -> Result<MessageId, StoreError>;

    /// Claim up to `limit` pending messages of one partition atomically.
    async fn claim(&self, topic: &str, partition: u32, limit: usize) -> Result<Vec<Delivery>, StoreError>;

    /// Remove a message for good.
    async fn ack(&self, id: MessageId) -> Result<(), StoreError>;

    /// Return a claimed message to pending so the next claim delivers it again.
    async fn release(&self, id: MessageId) -> Result<(), StoreError>;

    /// Make messages claimed but never acknowledged claimable again.
    /// Call on startup to recover from crashes.
    /// Returns the number of messages recovered.
    async fn recover_in_flight(&self, topic: &str) -> Result<usize, StoreError>;

    /// Messages of a topic not yet acknowledged, in flight included.
    async fn outstanding(&self, topic: &str) -> Result<usize, StoreError>;
}
