//! In-process implementations of the service interfaces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use super::{
    ContentStore, Depublisher, IndexingEngine, MetadataService, NewVersion, Representation,
    ResultSlice, RevisionEntry, RevisionQuery, RunRegistry,
};
use crate::step::StepError;

/// Content keyed by resource locator.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, resource: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.lock().await.insert(resource.into(), content.into());
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn read(&self, resource: &str, _authorization: Option<&str>) -> Result<Vec<u8>, StepError> {
        self.files
            .lock()
            .await
            .get(resource)
            .cloned()
            .ok_or_else(|| StepError::permanent(anyhow::anyhow!("no content at {resource}")))
    }
}

#[derive(Debug)]
struct StoredVersion {
    representation: Representation,
    file_url: String,
}

type VersionKey = (String, String, String);
type RevisionKey = (String, String, String);

#[derive(Debug, Default)]
struct MetadataState {
    versions: BTreeMap<VersionKey, StoredVersion>,
    contents: HashMap<String, Vec<u8>>,
    revisions: HashMap<RevisionKey, Vec<RevisionEntry>>,
}

/// Metadata service kept in process memory.
///
/// Versions created with both a dataset and a revision are listed for that
/// dataset revision, so a follow-up task can read what an earlier one wrote.
#[derive(Debug)]
pub struct InMemoryMetadataService {
    base_url: String,
    page_size: usize,
    state: Mutex<MetadataState>,
}

impl InMemoryMetadataService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: 100,
            state: Mutex::new(MetadataState::default()),
        }
    }

    /// Entries returned per listing page. Values below 1 are raised to 1.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make `entry` part of a dataset revision.
    pub async fn add_revision_entry(
        &self,
        provider_id: &str,
        dataset_id: &str,
        revision_name: &str,
        entry: RevisionEntry,
    ) {
        self.state
            .lock()
            .await
            .revisions
            .entry(revision_key(provider_id, dataset_id, revision_name))
            .or_default()
            .push(entry);
    }

    /// Content of a file created through this service.
    pub async fn content(&self, file_url: &str) -> Option<Vec<u8>> {
        self.state.lock().await.contents.get(file_url).cloned()
    }

    pub async fn version_count(&self) -> usize {
        self.state.lock().await.versions.len()
    }
}

fn revision_key(provider_id: &str, dataset_id: &str, revision_name: &str) -> RevisionKey {
    (
        provider_id.to_string(),
        dataset_id.to_string(),
        revision_name.to_string(),
    )
}

#[async_trait]
impl MetadataService for InMemoryMetadataService {
    async fn create_representation_version(&self, version: &NewVersion) -> Result<String, StepError> {
        let version_id = uuid::Uuid::new_v4().to_string();
        let file_url = format!(
            "{}/records/{}/representations/{}/versions/{}/files/{}",
            self.base_url, version.cloud_id, version.representation_name, version_id, version.file_name
        );

        let mut state = self.state.lock().await;
        if let (Some(dataset_id), Some(revision)) = (&version.dataset_id, &version.revision) {
            state
                .revisions
                .entry(revision_key(&version.provider_id, dataset_id, &revision.name))
                .or_default()
                .push(RevisionEntry {
                    cloud_id: version.cloud_id.clone(),
                    representation_name: version.representation_name.clone(),
                    version: version_id.clone(),
                    file_url: file_url.clone(),
                    deleted: false,
                });
        }
        state.contents.insert(file_url.clone(), version.content.clone());
        state.versions.insert(
            (
                version.cloud_id.clone(),
                version.representation_name.clone(),
                version_id.clone(),
            ),
            StoredVersion {
                representation: Representation {
                    cloud_id: version.cloud_id.clone(),
                    representation_name: version.representation_name.clone(),
                    version: version_id,
                    data_provider: version.provider_id.clone(),
                    files: vec![version.file_name.clone()],
                    persistent: true,
                },
                file_url: file_url.clone(),
            },
        );
        Ok(file_url)
    }

    async fn get_representation(
        &self,
        cloud_id: &str,
        representation_name: &str,
        version: &str,
    ) -> Result<Option<Representation>, StepError> {
        let key = (
            cloud_id.to_string(),
            representation_name.to_string(),
            version.to_string(),
        );
        Ok(self
            .state
            .lock()
            .await
            .versions
            .get(&key)
            .map(|v| v.representation.clone()))
    }

    async fn get_file_uri(
        &self,
        cloud_id: &str,
        representation_name: &str,
        version: &str,
        file_name: &str,
    ) -> Result<String, StepError> {
        let key = (
            cloud_id.to_string(),
            representation_name.to_string(),
            version.to_string(),
        );
        let state = self.state.lock().await;
        state
            .versions
            .get(&key)
            .filter(|v| v.representation.files.iter().any(|f| f == file_name))
            .map(|v| v.file_url.clone())
            .ok_or_else(|| {
                StepError::permanent(anyhow::anyhow!(
                    "file {file_name} not found in {cloud_id}/{representation_name}/{version}"
                ))
            })
    }

    async fn list_revisions_for_dataset(
        &self,
        query: &RevisionQuery,
        continuation: Option<&str>,
    ) -> Result<ResultSlice<RevisionEntry>, StepError> {
        let start = match continuation {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| {
                StepError::permanent(anyhow::anyhow!("invalid continuation token {token}"))
            })?,
        };

        let state = self.state.lock().await;
        let key = revision_key(&query.provider_id, &query.dataset_id, &query.revision.name);
        let entries: Vec<&RevisionEntry> = state
            .revisions
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|e| e.representation_name == query.representation_name)
            .collect();

        let end = (start + self.page_size).min(entries.len());
        let page = entries
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|e| (*e).clone())
            .collect();

        Ok(if end < entries.len() {
            ResultSlice::with_next(page, end.to_string())
        } else {
            ResultSlice::last(page)
        })
    }
}

/// Serves the files written through the service.
#[async_trait]
impl ContentStore for InMemoryMetadataService {
    async fn read(&self, resource: &str, _authorization: Option<&str>) -> Result<Vec<u8>, StepError> {
        self.content(resource)
            .await
            .ok_or_else(|| StepError::permanent(anyhow::anyhow!("no file at {resource}")))
    }
}

/// A record handed to [`RecordingIndexer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRecord {
    pub endpoint: String,
    pub record_date: DateTime<Utc>,
    pub content: Vec<u8>,
}

/// Indexing engine that keeps what it was given.
#[derive(Debug, Default)]
pub struct RecordingIndexer {
    indexed: Mutex<Vec<IndexedRecord>>,
}

impl RecordingIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn indexed(&self) -> Vec<IndexedRecord> {
        self.indexed.lock().await.clone()
    }
}

#[async_trait]
impl IndexingEngine for RecordingIndexer {
    async fn index(
        &self,
        endpoint: &str,
        content: &[u8],
        record_date: DateTime<Utc>,
    ) -> Result<(), StepError> {
        self.indexed.lock().await.push(IndexedRecord {
            endpoint: endpoint.to_string(),
            record_date,
            content: content.to_vec(),
        });
        Ok(())
    }
}

/// Depublisher that keeps the resources it removed.
#[derive(Debug, Default)]
pub struct RecordingDepublisher {
    removed: Mutex<Vec<String>>,
}

impl RecordingDepublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn removed(&self) -> Vec<String> {
        self.removed.lock().await.clone()
    }
}

#[async_trait]
impl Depublisher for RecordingDepublisher {
    async fn depublish(&self, resource: &str) -> Result<(), StepError> {
        self.removed.lock().await.push(resource.to_string());
        Ok(())
    }
}

/// Run registry for runs living in this process.
#[derive(Debug, Default)]
pub struct LocalRunRegistry {
    active: Mutex<HashSet<String>>,
}

impl LocalRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, owner: impl Into<String>) {
        self.active.lock().await.insert(owner.into());
    }

    /// Forget a run. Returns false if it was not registered.
    pub async fn deregister(&self, owner: &str) -> bool {
        self.active.lock().await.remove(owner)
    }
}

#[async_trait]
impl RunRegistry for LocalRunRegistry {
    async fn is_active(&self, owner: &str) -> Result<bool, StepError> {
        Ok(self.active.lock().await.contains(owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Revision;

    fn query(revision: &str) -> RevisionQuery {
        RevisionQuery {
            provider_id: "provider_1".into(),
            dataset_id: "dataset_1".into(),
            representation_name: "edm".into(),
            revision: Revision::new(revision, "provider_1", Utc::now()),
        }
    }

    fn entry(cloud_id: &str) -> RevisionEntry {
        RevisionEntry {
            cloud_id: cloud_id.into(),
            representation_name: "edm".into(),
            version: "v1".into(),
            file_url: format!("http://host/records/{cloud_id}/representations/edm/versions/v1/files/f"),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_listing_pages_through_entries() {
        let service = InMemoryMetadataService::new("http://host").with_page_size(2);
        for id in ["a", "b", "c"] {
            service
                .add_revision_entry("provider_1", "dataset_1", "harvested", entry(id))
                .await;
        }

        let first = service
            .list_revisions_for_dataset(&query("harvested"), None)
            .await
            .unwrap();
        assert_eq!(first.results.len(), 2);
        let token = first.next_token.unwrap();

        let second = service
            .list_revisions_for_dataset(&query("harvested"), Some(&token))
            .await
            .unwrap();
        assert_eq!(second.results, vec![entry("c")]);
        assert!(second.next_token.is_none());

        let other = service
            .list_revisions_for_dataset(&query("validated"), None)
            .await
            .unwrap();
        assert!(other.results.is_empty());
        assert!(other.next_token.is_none());
    }

    #[tokio::test]
    async fn test_created_version_is_listed_under_its_revision() {
        let service = InMemoryMetadataService::new("http://host/");
        let revision = Revision::new("validated", "provider_1", Utc::now());
        let url = service
            .create_representation_version(&NewVersion {
                cloud_id: "CLOUD".into(),
                representation_name: "edm".into(),
                provider_id: "provider_1".into(),
                dataset_id: Some("dataset_1".into()),
                file_name: "record.xml".into(),
                mime_type: "text/xml".into(),
                content: b"<rdf/>".to_vec(),
                revision: Some(revision),
                authorization: None,
            })
            .await
            .unwrap();

        assert!(url.starts_with("http://host/records/CLOUD/representations/edm/versions/"));
        assert_eq!(service.content(&url).await.unwrap(), b"<rdf/>");

        let listed = service
            .list_revisions_for_dataset(&query("validated"), None)
            .await
            .unwrap();
        assert_eq!(listed.results.len(), 1);
        assert_eq!(listed.results[0].file_url, url);

        let version = &listed.results[0].version;
        let found = service
            .get_file_uri("CLOUD", "edm", version, "record.xml")
            .await
            .unwrap();
        assert_eq!(found, url);
        assert!(service
            .get_file_uri("CLOUD", "edm", version, "other.xml")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_content_is_permanent() {
        let store = InMemoryContentStore::new();
        store.put("http://host/a", b"x".to_vec()).await;
        assert_eq!(store.read("http://host/a", None).await.unwrap(), b"x");
        let err = store.read("http://host/b", None).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_local_registry_tracks_runs() {
        let registry = LocalRunRegistry::new();
        registry.register("run-1").await;
        assert!(registry.is_active("run-1").await.unwrap());
        assert!(!registry.is_active("run-2").await.unwrap());

        assert!(registry.deregister("run-1").await);
        assert!(!registry.deregister("run-1").await);
        assert!(!registry.is_active("run-1").await.unwrap());
    }
}
