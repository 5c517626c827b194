//! Stage trait, stage outcomes and error types.

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::RecordEnvelope;
use crate::task::TaskId;

/// Error returned by a stage or by a call to an external service.
#[derive(Error, Debug)]
pub enum StepError {
    /// The call may succeed if repeated, e.g. a dropped connection.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Repeating the call cannot help, e.g. missing input.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StepError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The underlying error, without the retryable/permanent label.
    pub fn inner(&self) -> &anyhow::Error {
        match self {
            Self::Retryable(err) | Self::Permanent(err) => err,
        }
    }
}

/// A record that could not be processed, bound for the notification stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub task_id: TaskId,
    pub resource: String,
    pub message: String,
    pub additional_info: String,
}

/// What a stage decided to do with a record.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Hand the (possibly changed) envelope to the next stage.
    Forward(RecordEnvelope),
    /// Stop processing this record and report it as failed.
    Error(RecordError),
    /// Stop processing this record and count it as deleted.
    Drop { task_id: TaskId, resource: String },
}

impl Outcome {
    /// Build an error outcome for the given envelope.
    pub fn error(
        envelope: &RecordEnvelope,
        message: impl Into<String>,
        additional_info: impl Into<String>,
    ) -> Self {
        Self::Error(RecordError {
            task_id: envelope.task_id,
            resource: envelope.resource.clone(),
            message: message.into(),
            additional_info: additional_info.into(),
        })
    }

    /// Build a drop outcome for the given envelope.
    pub fn drop(envelope: &RecordEnvelope) -> Self {
        Self::Drop {
            task_id: envelope.task_id,
            resource: envelope.resource.clone(),
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forward(_) => "forward",
            Self::Error(_) => "error",
            Self::Drop { .. } => "drop",
        }
    }
}

/// A single processing step in a topology.
///
/// Stages are stateless with respect to records: everything a stage needs to
/// know about a record travels in the envelope it receives.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The name of this stage for logging and topic naming.
    fn name(&self) -> &'static str;

    /// Process one record.
    ///
    /// Domain failures should be returned as `Ok(Outcome::Error(..))`. An
    /// `Err` is turned into an error outcome by the caller, carrying the
    /// error text.
    async fn process(&self, envelope: RecordEnvelope) -> Result<Outcome, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_classification() {
        assert!(StepError::retryable(anyhow::anyhow!("timeout")).is_retryable());
        assert!(!StepError::permanent(anyhow::anyhow!("bad input")).is_retryable());
    }

    #[test]
    fn test_error_outcome_carries_record_identity() {
        let envelope = RecordEnvelope::new(TaskId(7), "validation", "http://host/r/1");
        match Outcome::error(&envelope, "invalid", "line 3") {
            Outcome::Error(err) => {
                assert_eq!(err.task_id, TaskId(7));
                assert_eq!(err.resource, "http://host/r/1");
                assert_eq!(err.message, "invalid");
                assert_eq!(err.additional_info, "line 3");
            }
            other => panic!("unexpected outcome {}", other.kind()),
        }
    }
}
