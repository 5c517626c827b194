//! Stage implementations for the common topologies.
//!
//! Each stage wraps one external system and reaches it only through a
//! [`RetryExecutor`](crate::retry::RetryExecutor). Problems with the record
//! itself come back as [`Outcome::Error`](crate::step::Outcome::Error);
//! failed calls come back as `Err` and are reported by whoever runs the
//! stage.

mod depublish;
mod indexing;
mod reader;
mod validation;
mod writer;

pub use depublish::DepublishStage;
pub use indexing::IndexingStage;
pub use reader::ReadFileStage;
pub use validation::ValidationStage;
pub use writer::{WriteRecordStage, DEFAULT_MIME_TYPE};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::envelope::RecordEnvelope;
    use crate::step::Outcome;

    pub fn forwarded(outcome: Outcome) -> RecordEnvelope {
        match outcome {
            Outcome::Forward(envelope) => envelope,
            other => panic!("expected forward, got {}", other.kind()),
        }
    }
}
