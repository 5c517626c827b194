//! In-memory implementation of MessageQueue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::store::{Delivery, MessageId, MessageQueue};
use crate::envelope::RecordEnvelope;
use crate::error::StoreError;

#[derive(Debug)]
struct StoredMessage {
    topic: String,
    partition: u32,
    envelope: RecordEnvelope,
    in_flight: bool,
    attempts: u32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    messages: BTreeMap<MessageId, StoredMessage>,
}

/// Queue kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(
        &self,
        topic: &str,
        partition: u32,
        envelope: &RecordEnvelope,
    ) -> Result<MessageId, StoreError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = MessageId(state.next_id);
        state.messages.insert(
            id,
            StoredMessage {
                topic: topic.to_string(),
                partition,
                envelope: envelope.clone(),
                in_flight: false,
                attempts: 0,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn claim(&self, topic: &str, partition: u32, limit: usize) -> Result<Vec<Delivery>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .messages
            .iter_mut()
            .filter(|(_, m)| !m.in_flight && m.partition == partition && m.topic == topic)
            .take(limit)
            .map(|(id, m)| {
                m.in_flight = true;
                m.attempts += 1;
                Delivery {
                    id: *id,
                    topic: m.topic.clone(),
                    partition: m.partition,
                    envelope: m.envelope.clone(),
                    attempts: m.attempts,
                    created_at: m.created_at,
                }
            })
            .collect())
    }

    async fn ack(&self, id: MessageId) -> Result<(), StoreError> {
        self.state.lock().await.messages.remove(&id);
        Ok(())
    }

    async fn release(&self, id: MessageId) -> Result<(), StoreError> {
        if let Some(message) = self.state.lock().await.messages.get_mut(&id) {
            message.in_flight = false;
        }
        Ok(())
    }

    async fn recover_in_flight(&self, topic: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for message in state.messages.values_mut() {
            if message.in_flight && message.topic == topic {
                message.in_flight = false;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn outstanding(&self, topic: &str) -> Result<usize, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.topic == topic)
            .count())
    }
}
