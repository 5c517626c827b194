//! Stage that checks records against their schema.

use async_trait::async_trait;
use std::sync::Arc;

use crate::envelope::{params, RecordEnvelope};
use crate::retry::RetryExecutor;
use crate::services::{Validator, Verdict};
use crate::step::{Outcome, Stage, StepError};

/// Checks each record against the schema named by the task.
pub struct ValidationStage {
    validator: Arc<dyn Validator>,
    retry: RetryExecutor,
}

impl ValidationStage {
    pub fn new(validator: Arc<dyn Validator>, retry: RetryExecutor) -> Self {
        Self { validator, retry }
    }
}

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn process(&self, envelope: RecordEnvelope) -> Result<Outcome, StepError> {
        if envelope.is_marked_deleted() {
            return Ok(Outcome::Forward(envelope));
        }

        let Some(schema) = envelope.parameter(params::SCHEMA_NAME).map(str::to_owned) else {
            return Ok(Outcome::error(&envelope, "Schema name is missing", ""));
        };
        let version = envelope.parameter(params::SCHEMA_VERSION).map(str::to_owned);
        let Some(content) = envelope.payload.as_deref() else {
            return Ok(Outcome::error(&envelope, "Record has no content to validate", ""));
        };

        let verdict = self
            .retry
            .execute(&format!("Error while validating {}", envelope.resource), || {
                self.validator.validate(content, &schema, version.as_deref())
            })
            .await?;

        Ok(match verdict {
            Verdict::Valid => Outcome::Forward(envelope),
            Verdict::Invalid { message, details } => Outcome::error(&envelope, message, details),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    /// Accepts content containing `<rdf`, knows only the `edm` schema.
    struct EdmValidator;

    #[async_trait]
    impl Validator for EdmValidator {
        async fn validate(
            &self,
            content: &[u8],
            schema: &str,
            _version: Option<&str>,
        ) -> Result<Verdict, StepError> {
            if schema != "edm" {
                return Err(StepError::permanent(anyhow::anyhow!("schema {schema} not found")));
            }
            if content.windows(4).any(|w| w == b"<rdf") {
                Ok(Verdict::Valid)
            } else {
                Ok(Verdict::Invalid {
                    message: "Not an RDF document".into(),
                    details: "line 1".into(),
                })
            }
        }
    }

    fn stage() -> ValidationStage {
        ValidationStage::new(Arc::new(EdmValidator), RetryExecutor::no_retry())
    }

    fn envelope(content: &[u8]) -> RecordEnvelope {
        RecordEnvelope::new(TaskId(4), "validate", "http://host/r/1")
            .with_payload(content.to_vec())
            .with_parameter(params::SCHEMA_NAME, "edm")
    }

    #[tokio::test]
    async fn test_valid_record_is_forwarded() {
        let outcome = stage().process(envelope(b"<rdf:RDF/>")).await.unwrap();
        assert!(matches!(outcome, Outcome::Forward(_)));
    }

    #[tokio::test]
    async fn test_invalid_record_becomes_error_outcome() {
        match stage().process(envelope(b"<html/>")).await.unwrap() {
            Outcome::Error(err) => {
                assert_eq!(err.resource, "http://host/r/1");
                assert_eq!(err.message, "Not an RDF document");
                assert_eq!(err.additional_info, "line 1");
            }
            other => panic!("expected error, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_missing_schema_name_is_record_error() {
        let mut envelope = envelope(b"<rdf/>");
        envelope.remove_parameter(params::SCHEMA_NAME);
        let outcome = stage().process(envelope).await.unwrap();
        assert_eq!(outcome.kind(), "error");
    }

    #[tokio::test]
    async fn test_unknown_schema_is_permanent() {
        let envelope = envelope(b"<rdf/>").with_parameter(params::SCHEMA_NAME, "marc");
        let err = stage().process(envelope).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
