//! Stage that stores each record as a new representation version.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::counter::{dataset_object_id, BucketedCounter};
use crate::envelope::{params, RecordEnvelope};
use crate::locator::RecordLocator;
use crate::retry::RetryExecutor;
use crate::services::{MetadataService, NewVersion};
use crate::step::{Outcome, Stage, StepError};

/// Mime type of written files unless the task says otherwise.
pub const DEFAULT_MIME_TYPE: &str = "text/xml";

/// Persists each record as a new representation version.
///
/// The location of the written file is forwarded as [`params::OUTPUT_URL`];
/// the payload and the reader's transient parameters are not. Records
/// marked deleted are dropped instead of written.
pub struct WriteRecordStage {
    metadata: Arc<dyn MetadataService>,
    retry: RetryExecutor,
    revision_index: Option<BucketedCounter>,
}

impl WriteRecordStage {
    pub fn new(metadata: Arc<dyn MetadataService>, retry: RetryExecutor) -> Self {
        Self {
            metadata,
            retry,
            revision_index: None,
        }
    }

    /// Count every record written to a dataset in `index`.
    pub fn with_revision_index(mut self, index: BucketedCounter) -> Self {
        self.revision_index = Some(index);
        self
    }
}

/// Builds the version to create, or the reason it cannot be built.
fn new_version(envelope: &RecordEnvelope) -> Result<NewVersion, &'static str> {
    let locator = RecordLocator::parse(&envelope.resource);
    let cloud_id = envelope
        .parameter(params::CLOUD_ID)
        .map(str::to_owned)
        .or_else(|| locator.as_ref().map(|l| l.cloud_id.clone()))
        .ok_or("Cannot determine the record identifier")?;
    let representation_name = envelope
        .parameter(params::NEW_REPRESENTATION_NAME)
        .ok_or("Output representation name is missing")?;
    let provider_id = envelope
        .parameter(params::PROVIDER_ID)
        .ok_or("Provider id is missing")?;
    let content = envelope
        .payload
        .clone()
        .ok_or("Record has no content to write")?;
    let file_name = envelope
        .parameter(params::FILE_NAME)
        .map(str::to_owned)
        .or_else(|| locator.map(|l| l.file_name))
        .unwrap_or_else(|| cloud_id.clone());

    Ok(NewVersion {
        cloud_id,
        representation_name: representation_name.to_string(),
        provider_id: provider_id.to_string(),
        dataset_id: envelope.parameter(params::OUTPUT_DATASET).map(str::to_owned),
        file_name,
        mime_type: envelope
            .parameter(params::OUTPUT_MIME_TYPE)
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string(),
        content,
        revision: envelope.revision.clone(),
        authorization: envelope.parameter(params::AUTHORIZATION).map(str::to_owned),
    })
}

#[async_trait]
impl Stage for WriteRecordStage {
    fn name(&self) -> &'static str {
        "write"
    }

    async fn process(&self, mut envelope: RecordEnvelope) -> Result<Outcome, StepError> {
        if envelope.is_marked_deleted() {
            debug!(resource = %envelope.resource, "Record marked deleted, not writing");
            return Ok(Outcome::drop(&envelope));
        }

        let version = match new_version(&envelope) {
            Ok(version) => version,
            Err(message) => return Ok(Outcome::error(&envelope, message, "")),
        };

        let output_url = self
            .retry
            .execute(&format!("Error while writing {}", envelope.resource), || {
                self.metadata.create_representation_version(&version)
            })
            .await?;

        if let (Some(index), Some(dataset_id)) = (&self.revision_index, &version.dataset_id) {
            let object_id = &dataset_object_id(&version.provider_id, dataset_id);
            self.retry
                .execute(&format!("Error while counting {object_id}"), move || async move {
                    index.add_row(object_id).await.map_err(StepError::from)
                })
                .await?;
        }

        debug!(resource = %envelope.resource, %output_url, "Record written");
        envelope.set_parameter(params::OUTPUT_URL, output_url);
        for key in params::TRANSIENT {
            envelope.remove_parameter(key);
        }
        envelope.payload = None;
        Ok(Outcome::Forward(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{Bucket, BucketStore, InMemoryBucketStore};
    use crate::error::StoreError;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use crate::services::InMemoryMetadataService;
    use crate::stages::test_support::forwarded;
    use crate::task::TaskId;

    const FILE: &str = "http://host/records/CLOUD1/representations/edm/versions/v1/files/f.xml";

    fn envelope() -> RecordEnvelope {
        RecordEnvelope::new(TaskId(2), "write", FILE)
            .with_payload(b"<rdf/>".to_vec())
            .with_parameter(params::NEW_REPRESENTATION_NAME, "edm_internal")
            .with_parameter(params::PROVIDER_ID, "provider_1")
            .with_parameter(params::OUTPUT_DATASET, "dataset_1")
            .with_parameter(params::CLOUD_ID, "CLOUD1")
            .with_parameter(params::FILE_NAME, "f.xml")
    }

    #[tokio::test]
    async fn test_writes_version_and_strips_transient_state() {
        let metadata = Arc::new(InMemoryMetadataService::new("http://store"));
        let stage = WriteRecordStage::new(metadata.clone(), RetryExecutor::no_retry());

        let envelope = forwarded(stage.process(envelope()).await.unwrap());

        let url = envelope.parameter(params::OUTPUT_URL).unwrap();
        assert!(url.starts_with("http://store/records/CLOUD1/representations/edm_internal/"));
        assert!(url.ends_with("/files/f.xml"));
        assert_eq!(metadata.content(url).await.unwrap(), b"<rdf/>");
        for key in params::TRANSIENT {
            assert!(envelope.parameter(key).is_none(), "{key} was forwarded");
        }
        assert!(envelope.payload.is_none());
        assert_eq!(envelope.parameter(params::PROVIDER_ID), Some("provider_1"));
    }

    #[tokio::test]
    async fn test_written_records_are_counted_per_dataset() {
        let metadata = Arc::new(InMemoryMetadataService::new("http://store"));
        let index = BucketedCounter::new(Arc::new(InMemoryBucketStore::new()), 2);
        let stage = WriteRecordStage::new(metadata, RetryExecutor::no_retry())
            .with_revision_index(index.clone());

        for _ in 0..3 {
            stage.process(envelope()).await.unwrap();
        }

        let object_id = dataset_object_id("provider_1", "dataset_1");
        assert_eq!(index.total(&object_id).await.unwrap(), 3);
        assert_eq!(index.buckets(&object_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_record_is_dropped() {
        let metadata = Arc::new(InMemoryMetadataService::new("http://store"));
        let stage = WriteRecordStage::new(metadata.clone(), RetryExecutor::no_retry());
        let envelope = envelope().with_parameter(params::MARKED_DELETED, "true");

        let outcome = stage.process(envelope).await.unwrap();
        assert_eq!(outcome.kind(), "drop");
        assert_eq!(metadata.version_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_output_name_is_record_error() {
        let metadata = Arc::new(InMemoryMetadataService::new("http://store"));
        let stage = WriteRecordStage::new(metadata.clone(), RetryExecutor::no_retry());
        let mut envelope = envelope();
        envelope.remove_parameter(params::NEW_REPRESENTATION_NAME);

        match stage.process(envelope).await.unwrap() {
            Outcome::Error(err) => {
                assert_eq!(err.message, "Output representation name is missing");
                assert_eq!(err.resource, FILE);
            }
            other => panic!("expected error, got {}", other.kind()),
        }
        assert_eq!(metadata.version_count().await, 0);
    }

    /// Bucket store whose first increment fails.
    #[derive(Default)]
    struct FlakyBuckets {
        inner: InMemoryBucketStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl BucketStore for FlakyBuckets {
        async fn current(&self, object_id: &str) -> Result<Option<Bucket>, StoreError> {
            self.inner.current(object_id).await
        }

        async fn allocate(&self, object_id: &str) -> Result<Bucket, StoreError> {
            self.inner.allocate(object_id).await
        }

        async fn increment(&self, object_id: &str, bucket_id: &str, rows: u64) -> Result<(), StoreError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Storage("connection reset".into()));
            }
            self.inner.increment(object_id, bucket_id, rows).await
        }

        async fn buckets(&self, object_id: &str) -> Result<Vec<Bucket>, StoreError> {
            self.inner.buckets(object_id).await
        }
    }

    #[tokio::test]
    async fn test_counting_is_retried() {
        let metadata = Arc::new(InMemoryMetadataService::new("http://store"));
        let index = BucketedCounter::new(Arc::new(FlakyBuckets::default()), 10);
        let retry = RetryExecutor::new(RetryPolicy::fixed(2, Duration::ZERO));
        let stage = WriteRecordStage::new(metadata.clone(), retry).with_revision_index(index.clone());

        forwarded(stage.process(envelope()).await.unwrap());

        let object_id = dataset_object_id("provider_1", "dataset_1");
        assert_eq!(index.total(&object_id).await.unwrap(), 1);
        assert_eq!(metadata.version_count().await, 1);
    }
}
