//! Stage that sends records to an indexing environment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::IndexingConfig;
use crate::envelope::{params, RecordEnvelope};
use crate::retry::RetryExecutor;
use crate::services::IndexingEngine;
use crate::step::{Outcome, Stage, StepError};

/// Writes each record to the search index of the task's target environment.
pub struct IndexingStage {
    engine: Arc<dyn IndexingEngine>,
    config: IndexingConfig,
    retry: RetryExecutor,
}

impl IndexingStage {
    pub fn new(engine: Arc<dyn IndexingEngine>, config: IndexingConfig, retry: RetryExecutor) -> Self {
        Self {
            engine,
            config,
            retry,
        }
    }
}

/// The record date to index with. Absent means now.
fn record_date(envelope: &RecordEnvelope) -> Result<DateTime<Utc>, String> {
    match envelope.parameter(params::RECORD_DATE) {
        None => Ok(Utc::now()),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|date| date.with_timezone(&Utc))
            .map_err(|e| format!("Cannot parse {} '{raw}': {e}", params::RECORD_DATE)),
    }
}

#[async_trait]
impl Stage for IndexingStage {
    fn name(&self) -> &'static str {
        "index"
    }

    async fn process(&self, envelope: RecordEnvelope) -> Result<Outcome, StepError> {
        if envelope.is_marked_deleted() {
            return Ok(Outcome::Forward(envelope));
        }

        let Some(environment) = envelope.parameter(params::TARGET_ENVIRONMENT) else {
            return Ok(Outcome::error(&envelope, "Target environment is missing", ""));
        };
        let Some(endpoint) = self.config.endpoint(environment) else {
            let message = format!("No indexing configuration for environment {environment}");
            return Ok(Outcome::error(&envelope, message, ""));
        };
        let date = match record_date(&envelope) {
            Ok(date) => date,
            Err(message) => return Ok(Outcome::error(&envelope, message, "")),
        };
        let Some(content) = envelope.payload.as_deref() else {
            return Ok(Outcome::error(&envelope, "Record has no content to index", ""));
        };

        self.retry
            .execute(&format!("Error while indexing {}", envelope.resource), || {
                self.engine.index(endpoint, content, date)
            })
            .await?;

        Ok(Outcome::Forward(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::RecordingIndexer;
    use crate::task::TaskId;
    use chrono::TimeZone;

    fn stage(indexer: Arc<RecordingIndexer>) -> IndexingStage {
        IndexingStage::new(
            indexer,
            IndexingConfig::default().with_environment("PREVIEW", "http://preview-index"),
            RetryExecutor::no_retry(),
        )
    }

    fn envelope() -> RecordEnvelope {
        RecordEnvelope::new(TaskId(9), "index", "http://host/r/1")
            .with_payload(b"<rdf/>".to_vec())
            .with_parameter(params::TARGET_ENVIRONMENT, "PREVIEW")
    }

    #[tokio::test]
    async fn test_indexes_into_configured_environment() {
        let indexer = Arc::new(RecordingIndexer::new());
        let envelope = envelope().with_parameter(params::RECORD_DATE, "2024-03-01T10:00:00Z");

        let outcome = stage(indexer.clone()).process(envelope).await.unwrap();
        assert!(matches!(outcome, Outcome::Forward(_)));

        let indexed = indexer.indexed().await;
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].endpoint, "http://preview-index");
        assert_eq!(
            indexed[0].record_date,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_environment_is_record_error() {
        let indexer = Arc::new(RecordingIndexer::new());
        let envelope = envelope().with_parameter(params::TARGET_ENVIRONMENT, "PUBLISH");

        match stage(indexer.clone()).process(envelope).await.unwrap() {
            Outcome::Error(err) => assert!(err.message.contains("PUBLISH")),
            other => panic!("expected error, got {}", other.kind()),
        }
        assert!(indexer.indexed().await.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_record_date_is_record_error() {
        let indexer = Arc::new(RecordingIndexer::new());
        let envelope = envelope().with_parameter(params::RECORD_DATE, "yesterday");

        match stage(indexer.clone()).process(envelope).await.unwrap() {
            Outcome::Error(err) => assert!(err.message.contains("yesterday")),
            other => panic!("expected error, got {}", other.kind()),
        }
        assert!(indexer.indexed().await.is_empty());
    }
}
