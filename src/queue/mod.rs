//! Partitioned message queues connecting stages.

pub mod memory;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use memory::InMemoryQueue;
pub use store::{Delivery, MessageId, MessageQueue};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteQueue;

/// Topic a stage consumes from.
pub fn stage_topic(topology: &str, stage: &str) -> String {
    format!("{topology}.{stage}")
}
