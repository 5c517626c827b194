//! Stage that fetches record content.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::envelope::{params, RecordEnvelope};
use crate::locator::RecordLocator;
use crate::retry::RetryExecutor;
use crate::services::ContentStore;
use crate::step::{Outcome, Stage, StepError};

/// Fetches the content of a record and attaches it as payload.
///
/// When the resource is a storage file locator, its coordinates are added to
/// the envelope so the writer can address the same record.
pub struct ReadFileStage {
    content: Arc<dyn ContentStore>,
    retry: RetryExecutor,
}

impl ReadFileStage {
    pub fn new(content: Arc<dyn ContentStore>, retry: RetryExecutor) -> Self {
        Self { content, retry }
    }
}

#[async_trait]
impl Stage for ReadFileStage {
    fn name(&self) -> &'static str {
        "read"
    }

    async fn process(&self, mut envelope: RecordEnvelope) -> Result<Outcome, StepError> {
        if let Some(locator) = RecordLocator::parse(&envelope.resource) {
            envelope.set_parameter(params::CLOUD_ID, locator.cloud_id);
            envelope.set_parameter(params::REPRESENTATION_NAME, locator.representation_name);
            envelope.set_parameter(params::REPRESENTATION_VERSION, locator.version);
            envelope.set_parameter(params::FILE_NAME, locator.file_name);
        }

        if envelope.is_marked_deleted() {
            debug!(resource = %envelope.resource, "Record marked deleted, nothing to read");
            return Ok(Outcome::Forward(envelope));
        }

        let resource = envelope.resource.clone();
        let authorization = envelope.parameter(params::AUTHORIZATION).map(str::to_owned);
        let content = self
            .retry
            .execute(&format!("Error while reading {resource}"), || {
                self.content.read(&resource, authorization.as_deref())
            })
            .await?;

        Ok(Outcome::Forward(envelope.with_payload(content)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::stages::test_support::forwarded;
    use crate::services::InMemoryContentStore;
    use crate::task::TaskId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const FILE: &str = "http://host/api/records/CLOUD1/representations/edm/versions/v1/files/f.xml";

    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContentStore for FlakyStore {
        async fn read(&self, _resource: &str, _auth: Option<&str>) -> Result<Vec<u8>, StepError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(StepError::retryable(anyhow::anyhow!("connection reset")))
            } else {
                Ok(b"<rdf/>".to_vec())
            }
        }
    }

    #[tokio::test]
    async fn test_reads_payload_and_locator_coordinates() {
        let store = Arc::new(InMemoryContentStore::new());
        store.put(FILE, b"<rdf/>".to_vec()).await;
        let stage = ReadFileStage::new(store, RetryExecutor::no_retry());

        let envelope = forwarded(
            stage
                .process(RecordEnvelope::new(TaskId(1), "t", FILE))
                .await
                .unwrap(),
        );
        assert_eq!(envelope.payload.as_deref(), Some(&b"<rdf/>"[..]));
        assert_eq!(envelope.parameter(params::CLOUD_ID), Some("CLOUD1"));
        assert_eq!(envelope.parameter(params::REPRESENTATION_NAME), Some("edm"));
        assert_eq!(envelope.parameter(params::REPRESENTATION_VERSION), Some("v1"));
        assert_eq!(envelope.parameter(params::FILE_NAME), Some("f.xml"));
    }

    #[tokio::test]
    async fn test_missing_content_fails_without_retry() {
        let stage = ReadFileStage::new(
            Arc::new(InMemoryContentStore::new()),
            RetryExecutor::default(),
        );
        let err = stage
            .process(RecordEnvelope::new(TaskId(1), "t", FILE))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Error while reading"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let stage = ReadFileStage::new(
            store.clone(),
            RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_secs(5))),
        );

        let outcome = stage
            .process(RecordEnvelope::new(TaskId(1), "t", FILE))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Forward(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deleted_record_is_forwarded_unread() {
        let stage = ReadFileStage::new(
            Arc::new(InMemoryContentStore::new()),
            RetryExecutor::no_retry(),
        );
        let envelope =
            RecordEnvelope::new(TaskId(1), "t", FILE).with_parameter(params::MARKED_DELETED, "true");

        let envelope = forwarded(stage.process(envelope).await.unwrap());
        assert!(envelope.payload.is_none());
    }
}
