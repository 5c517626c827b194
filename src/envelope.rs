//! Per-record messages passed between stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::task::{Task, TaskId};

/// Well-known parameter keys.
pub mod params {
    /// Id of the task whose output this task consumes.
    pub const PREVIOUS_TASK_ID: &str = "PREVIOUS_TASK_ID";
    /// Name of the schema bundle a validation stage checks against.
    pub const SCHEMA_NAME: &str = "SCHEMA_NAME";
    /// Optional version of the schema bundle.
    pub const SCHEMA_VERSION: &str = "SCHEMA_VERSION";
    /// Environment an indexing stage writes to.
    pub const TARGET_ENVIRONMENT: &str = "TARGET_INDEXING_DATABASE";
    /// Date stamped on indexed records, RFC 3339.
    pub const RECORD_DATE: &str = "RECORD_DATE";
    /// Representation name the writer persists under.
    pub const NEW_REPRESENTATION_NAME: &str = "NEW_REPRESENTATION_NAME";
    /// Mime type of the written file.
    pub const OUTPUT_MIME_TYPE: &str = "OUTPUT_MIME_TYPE";
    /// Location of the file written by the writer stage.
    pub const OUTPUT_URL: &str = "OUTPUT_URL";
    /// Provider owning the written records.
    pub const PROVIDER_ID: &str = "PROVIDER_ID";
    /// Dataset the written records are assigned to.
    pub const OUTPUT_DATASET: &str = "OUTPUT_DATASET";
    /// Authorization context forwarded to external services.
    pub const AUTHORIZATION: &str = "AUTHORIZATION_HEADER";
    /// Routing key override for partition selection.
    pub const ROUTING_KEY: &str = "ROUTING_KEY";
    /// Marks a record that should be removed rather than written.
    pub const MARKED_DELETED: &str = "MARKED_DELETED";

    pub const CLOUD_ID: &str = "CLOUD_ID";
    pub const REPRESENTATION_NAME: &str = "REPRESENTATION_NAME";
    pub const REPRESENTATION_VERSION: &str = "REPRESENTATION_VERSION";
    pub const FILE_NAME: &str = "FILE_NAME";

    /// Set by the reader, removed by the writer before forwarding.
    pub const TRANSIENT: &[&str] = &[CLOUD_ID, REPRESENTATION_NAME, REPRESENTATION_VERSION, FILE_NAME];
}

/// A revision tag attached to written records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub name: String,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Revision {
    pub fn new(name: impl Into<String>, provider: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            timestamp,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Describes the harvesting endpoint a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestDescriptor {
    pub url: String,
    pub metadata_prefix: String,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

/// One record travelling through a topology.
///
/// Envelopes are owned values: a stage consumes the envelope it was given
/// and returns a new one, so redelivered duplicates never share state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub task_id: TaskId,
    pub task_name: String,
    pub resource: String,
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub revision: Option<Revision>,
    #[serde(default)]
    pub harvesting: Option<HarvestDescriptor>,
}

impl RecordEnvelope {
    pub fn new(task_id: TaskId, task_name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            resource: resource.into(),
            payload: None,
            parameters: HashMap::new(),
            revision: None,
            harvesting: None,
        }
    }

    /// Envelope for one resource of a task, inheriting the task's parameters.
    pub fn for_task(task: &Task, resource: impl Into<String>) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name.clone(),
            resource: resource.into(),
            payload: None,
            parameters: task.parameters.clone(),
            revision: task.output_revision.clone(),
            harvesting: task.harvesting.clone(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_parameter(key, value);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn set_parameter(&mut self, key: &str, value: impl Into<String>) {
        self.parameters.insert(key.to_string(), value.into());
    }

    pub fn remove_parameter(&mut self, key: &str) -> Option<String> {
        self.parameters.remove(key)
    }

    /// Whether the source reported this record as deleted.
    pub fn is_marked_deleted(&self) -> bool {
        self.parameter(params::MARKED_DELETED)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Key used to choose a partition.
    ///
    /// Records sharing a key land on the same partition and keep their
    /// relative order through every stage.
    pub fn routing_key(&self) -> &str {
        self.parameter(params::ROUTING_KEY).unwrap_or(&self.resource)
    }
}
