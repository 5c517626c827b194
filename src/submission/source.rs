//! Where the records of a task come from.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::retry::RetryExecutor;
use crate::services::{MetadataService, RevisionEntry, RevisionQuery};
use crate::step::StepError;
use crate::task::{DatasetInput, Task, TaskInput};

/// One record to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub resource: String,
    /// Partition key, the resource itself when absent.
    pub routing_key: Option<String>,
    pub deleted: bool,
}

impl SourceRecord {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            routing_key: None,
            deleted: false,
        }
    }

    fn from_entry(entry: RevisionEntry) -> Self {
        Self {
            resource: entry.file_url,
            routing_key: Some(entry.cloud_id),
            deleted: entry.deleted,
        }
    }
}

/// Produces the records of a task.
pub trait RecordSource: Send + Sync {
    fn records<'a>(&'a self, task: &'a Task) -> BoxStream<'a, Result<SourceRecord, StepError>>;
}

fn listed(resources: &[String]) -> BoxStream<'_, Result<SourceRecord, StepError>> {
    stream::iter(resources.iter().map(|r| Ok(SourceRecord::new(r.as_str())))).boxed()
}

/// Submits exactly the resources a task lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceListSource;

impl RecordSource for ResourceListSource {
    fn records<'a>(&'a self, task: &'a Task) -> BoxStream<'a, Result<SourceRecord, StepError>> {
        match &task.input {
            TaskInput::Resources(resources) => listed(resources),
            TaskInput::Datasets(_) => stream::once(async move {
                Err(StepError::permanent(anyhow::anyhow!(
                    "task {} lists datasets but no dataset source is configured",
                    task.id
                )))
            })
            .boxed(),
        }
    }
}

/// Submits every version tagged with a revision of the task's datasets.
///
/// Pages are fetched one at a time through the retry executor. A page with
/// a continuation token is followed even when empty; a page without one
/// ends its dataset. Explicit resource lists are passed through unchanged.
pub struct DatasetRevisionSource {
    metadata: Arc<dyn MetadataService>,
    retry: RetryExecutor,
}

struct Cursor {
    dataset: usize,
    token: Option<String>,
}

impl DatasetRevisionSource {
    pub fn new(metadata: Arc<dyn MetadataService>, retry: RetryExecutor) -> Self {
        Self { metadata, retry }
    }

    async fn page(
        &self,
        input: &DatasetInput,
        token: Option<&str>,
    ) -> Result<(Vec<SourceRecord>, Option<String>), StepError> {
        let query = RevisionQuery {
            provider_id: input.provider_id.clone(),
            dataset_id: input.dataset_id.clone(),
            representation_name: input.representation_name.clone(),
            revision: input.revision.clone(),
        };
        let message = format!(
            "Error while listing revision {} of {}/{}",
            input.revision.name, input.provider_id, input.dataset_id
        );
        let slice = self
            .retry
            .execute(&message, || {
                self.metadata.list_revisions_for_dataset(&query, token)
            })
            .await?;

        debug!(
            provider_id = %input.provider_id,
            dataset_id = %input.dataset_id,
            count = slice.results.len(),
            more = slice.next_token.is_some(),
            "Fetched revision page"
        );
        let records = slice
            .results
            .into_iter()
            .filter(|e| e.representation_name == input.representation_name)
            .map(SourceRecord::from_entry)
            .collect();
        Ok((records, slice.next_token))
    }
}

impl RecordSource for DatasetRevisionSource {
    fn records<'a>(&'a self, task: &'a Task) -> BoxStream<'a, Result<SourceRecord, StepError>> {
        let datasets = match &task.input {
            TaskInput::Resources(resources) => return listed(resources),
            TaskInput::Datasets(datasets) => datasets,
        };

        let start = Cursor {
            dataset: 0,
            token: None,
        };
        stream::try_unfold(start, move |cursor| async move {
            let Some(input) = datasets.get(cursor.dataset) else {
                return Ok::<_, StepError>(None);
            };
            let (records, next_token) = self.page(input, cursor.token.as_deref()).await?;
            let next = match next_token {
                Some(token) => Cursor {
                    dataset: cursor.dataset,
                    token: Some(token),
                },
                None => Cursor {
                    dataset: cursor.dataset + 1,
                    token: None,
                },
            };
            Ok(Some((records, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, StepError>)))
        .try_flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Revision;
    use crate::services::{NewVersion, Representation, ResultSlice};
    use crate::task::TaskId;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Serves a fixed sequence of pages, ignoring the query.
    struct ScriptedPages {
        pages: Mutex<Vec<ResultSlice<RevisionEntry>>>,
        calls: AtomicU32,
    }

    impl ScriptedPages {
        fn new(mut pages: Vec<ResultSlice<RevisionEntry>>) -> Self {
            pages.reverse();
            Self {
                pages: Mutex::new(pages),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MetadataService for ScriptedPages {
        async fn create_representation_version(&self, _: &NewVersion) -> Result<String, StepError> {
            unimplemented!()
        }

        async fn get_representation(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Option<Representation>, StepError> {
            unimplemented!()
        }

        async fn get_file_uri(&self, _: &str, _: &str, _: &str, _: &str) -> Result<String, StepError> {
            unimplemented!()
        }

        async fn list_revisions_for_dataset(
            &self,
            _query: &RevisionQuery,
            _continuation: Option<&str>,
        ) -> Result<ResultSlice<RevisionEntry>, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages
                .lock()
                .await
                .pop()
                .ok_or_else(|| StepError::retryable(anyhow::anyhow!("connection refused")))
        }
    }

    fn entry(cloud_id: &str) -> RevisionEntry {
        RevisionEntry {
            cloud_id: cloud_id.into(),
            representation_name: "edm".into(),
            version: "v1".into(),
            file_url: format!("http://host/records/{cloud_id}/representations/edm/versions/v1/files/f"),
            deleted: cloud_id.ends_with("-deleted"),
        }
    }

    fn dataset_task(datasets: &[&str]) -> Task {
        let inputs = datasets
            .iter()
            .map(|d| DatasetInput {
                provider_id: "provider_1".into(),
                dataset_id: d.to_string(),
                representation_name: "edm".into(),
                revision: Revision::new("harvested", "provider_1", Utc::now()),
            })
            .collect();
        Task::new(TaskId(1), "task", "validation").with_input(TaskInput::Datasets(inputs))
    }

    #[tokio::test]
    async fn test_follows_tokens_across_empty_pages() {
        let metadata = Arc::new(ScriptedPages::new(vec![
            ResultSlice::with_next(vec![entry("a"), entry("b")], "t1"),
            ResultSlice::with_next(vec![], "t2"),
            ResultSlice::last(vec![entry("c-deleted")]),
        ]));
        let source = DatasetRevisionSource::new(metadata.clone(), RetryExecutor::no_retry());
        let task = dataset_task(&["dataset_1"]);

        let records: Vec<SourceRecord> = source.records(&task).try_collect().await.unwrap();

        let cloud_ids: Vec<_> = records.iter().map(|r| r.routing_key.as_deref().unwrap()).collect();
        assert_eq!(cloud_ids, ["a", "b", "c-deleted"]);
        assert!(records[2].deleted);
        assert_eq!(metadata.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_last_page_ends_the_dataset() {
        let metadata = Arc::new(ScriptedPages::new(vec![
            ResultSlice::with_next(vec![entry("a")], "t1"),
            ResultSlice::last(vec![]),
            ResultSlice::last(vec![entry("z")]),
        ]));
        let source = DatasetRevisionSource::new(metadata.clone(), RetryExecutor::no_retry());
        let task = dataset_task(&["dataset_1", "dataset_2"]);

        let records: Vec<SourceRecord> = source.records(&task).try_collect().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].routing_key.as_deref(), Some("z"));
        assert_eq!(metadata.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_listing_failure_ends_the_stream_with_error() {
        let metadata = Arc::new(ScriptedPages::new(vec![ResultSlice::with_next(
            vec![entry("a")],
            "t1",
        )]));
        let source = DatasetRevisionSource::new(metadata, RetryExecutor::no_retry());
        let task = dataset_task(&["dataset_1"]);

        let result: Result<Vec<SourceRecord>, StepError> = source.records(&task).try_collect().await;
        assert!(result.unwrap_err().to_string().contains("Error while listing revision harvested"));
    }

    #[tokio::test]
    async fn test_resource_list_source() {
        let task = Task::new(TaskId(1), "task", "validation").with_input(TaskInput::Resources(vec![
            "http://host/r/1".into(),
            "http://host/r/2".into(),
        ]));
        let records: Vec<SourceRecord> = ResourceListSource.records(&task).try_collect().await.unwrap();
        assert_eq!(records, vec![SourceRecord::new("http://host/r/1"), SourceRecord::new("http://host/r/2")]);

        let result: Result<Vec<SourceRecord>, StepError> =
            ResourceListSource.records(&dataset_task(&["d"])).try_collect().await;
        assert!(result.is_err());
    }
}
