//! Interfaces of the external systems stages talk to.
//!
//! Every method here is an I/O boundary and is called through a
//! [`RetryExecutor`](crate::retry::RetryExecutor). Implementations classify
//! their own failures: connectivity problems are `StepError::Retryable`,
//! anything a second attempt cannot fix (missing input, refused
//! credentials, unknown schema) is `StepError::Permanent`.

pub mod memory;

pub use memory::{
    InMemoryContentStore, InMemoryMetadataService, LocalRunRegistry, RecordingDepublisher,
    RecordingIndexer,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Revision;
use crate::step::StepError;

/// One page of a paged listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSlice<T> {
    pub results: Vec<T>,
    /// Token to fetch the next page with, `None` on the last page.
    pub next_token: Option<String>,
}

impl<T> ResultSlice<T> {
    pub fn last(results: Vec<T>) -> Self {
        Self {
            results,
            next_token: None,
        }
    }

    pub fn with_next(results: Vec<T>, next_token: impl Into<String>) -> Self {
        Self {
            results,
            next_token: Some(next_token.into()),
        }
    }
}

/// Which revision of a dataset to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionQuery {
    pub provider_id: String,
    pub dataset_id: String,
    pub representation_name: String,
    pub revision: Revision,
}

/// A representation version tagged with the queried revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionEntry {
    pub cloud_id: String,
    pub representation_name: String,
    pub version: String,
    /// Location of the version's content file.
    pub file_url: String,
    #[serde(default)]
    pub deleted: bool,
}

/// A stored representation version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    pub cloud_id: String,
    pub representation_name: String,
    pub version: String,
    pub data_provider: String,
    pub files: Vec<String>,
    pub persistent: bool,
}

/// Content and metadata of a version to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    pub cloud_id: String,
    pub representation_name: String,
    pub provider_id: String,
    pub dataset_id: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub revision: Option<Revision>,
    pub authorization: Option<String>,
}

/// The metadata and content storage service.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Create a new representation version holding one file.
    ///
    /// Returns the location of the stored file. Writing the same content
    /// twice for the same record must be safe.
    async fn create_representation_version(&self, version: &NewVersion) -> Result<String, StepError>;

    async fn get_representation(
        &self,
        cloud_id: &str,
        representation_name: &str,
        version: &str,
    ) -> Result<Option<Representation>, StepError>;

    async fn get_file_uri(
        &self,
        cloud_id: &str,
        representation_name: &str,
        version: &str,
        file_name: &str,
    ) -> Result<String, StepError>;

    /// One page of the versions tagged with a dataset revision.
    async fn list_revisions_for_dataset(
        &self,
        query: &RevisionQuery,
        continuation: Option<&str>,
    ) -> Result<ResultSlice<RevisionEntry>, StepError>;
}

/// Reads record content by locator.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn read(&self, resource: &str, authorization: Option<&str>) -> Result<Vec<u8>, StepError>;
}

/// Result of checking a record against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid { message: String, details: String },
}

/// Schema validation engine.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Check `content` against a named schema bundle.
    ///
    /// An unknown schema is a `StepError::Permanent`.
    async fn validate(
        &self,
        content: &[u8],
        schema: &str,
        version: Option<&str>,
    ) -> Result<Verdict, StepError>;
}

/// Search index the indexing stage writes to.
#[async_trait]
pub trait IndexingEngine: Send + Sync {
    async fn index(
        &self,
        endpoint: &str,
        content: &[u8],
        record_date: DateTime<Utc>,
    ) -> Result<(), StepError>;
}

/// Removes records from publication.
#[async_trait]
pub trait Depublisher: Send + Sync {
    async fn depublish(&self, resource: &str) -> Result<(), StepError>;
}

/// Knows which pipeline runs are still alive.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn is_active(&self, owner: &str) -> Result<bool, StepError>;
}
