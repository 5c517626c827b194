//! Topology builder and in-process stage chain.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::TopologyConfig;
use crate::envelope::RecordEnvelope;
use crate::hash::bucket_number;
use crate::queue::stage_topic;
use crate::step::{Outcome, RecordError, Stage};

/// Partitions per topic unless configured otherwise.
pub const DEFAULT_PARTITIONS: u32 = 8;

/// Metadata for stages.
///
/// Used to attach descriptions and tags for visualization.
#[derive(Default, Clone, Debug, Serialize)]
pub struct Metadata {
    /// Human-readable description for visualization.
    pub description: Option<String>,
    /// Arbitrary key-value tags for filtering and analytics.
    pub tags: HashMap<String, String>,
}

/// Serializable representation of a topology's structure.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyGraph {
    pub name: String,
    pub partitions: u32,
    pub stages: Vec<StageNode>,
}

/// A stage in the topology graph.
#[derive(Debug, Clone, Serialize)]
pub struct StageNode {
    pub name: String,
    pub index: usize,
    pub topic: String,
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// Error returned when a topology cannot be built.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology '{0}' has no stages")]
    NoStages(String),

    #[error("topology '{0}' must have at least one partition")]
    NoPartitions(String),

    #[error("topology '{topology}' has more than one stage named '{stage}'")]
    DuplicateStage { topology: String, stage: String },
}

/// Run one stage on one record.
///
/// A stage error is reported as an error outcome for the record; it never
/// escapes to the caller.
pub async fn run_stage(stage: &dyn Stage, envelope: RecordEnvelope) -> Outcome {
    let task_id = envelope.task_id;
    let resource = envelope.resource.clone();
    match stage.process(envelope).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                stage = stage.name(),
                task_id = %task_id,
                resource = %resource,
                retryable = err.is_retryable(),
                error = %err.inner(),
                "Stage failed"
            );
            Outcome::Error(RecordError {
                task_id,
                resource,
                message: err.inner().to_string(),
                additional_info: format!("{:?}", err.inner()),
            })
        }
    }
}

/// Builder for constructing topologies.
pub struct TopologyBuilder {
    name: String,
    partitions: u32,
    chained: bool,
    stages: Vec<Arc<dyn Stage>>,
    stage_metadata: Vec<Metadata>,
}

impl TopologyBuilder {
    /// Add the first stage.
    pub fn start_with(self, stage: impl Stage + 'static) -> Self {
        self.then(stage)
    }

    /// Add another stage after the ones already added.
    pub fn then(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self.stage_metadata.push(Metadata::default());
        self
    }

    /// Add a stage that is shared with other topologies.
    pub fn then_shared(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self.stage_metadata.push(Metadata::default());
        self
    }

    /// Add a description to the last added stage.
    pub fn desc(mut self, description: &str) -> Self {
        if let Some(meta) = self.stage_metadata.last_mut() {
            meta.description = Some(description.to_string());
        }
        self
    }

    /// Add a tag to the last added stage.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        if let Some(meta) = self.stage_metadata.last_mut() {
            meta.tags.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Set the number of partitions of every stage topic.
    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Mark tasks of this topology as consuming a previous task's output.
    pub fn chained(mut self, chained: bool) -> Self {
        self.chained = chained;
        self
    }

    /// Build the topology.
    pub fn build(self) -> Result<Topology, TopologyError> {
        if self.stages.is_empty() {
            return Err(TopologyError::NoStages(self.name));
        }
        if self.partitions == 0 {
            return Err(TopologyError::NoPartitions(self.name));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if self.stages[..i].iter().any(|s| s.name() == stage.name()) {
                return Err(TopologyError::DuplicateStage {
                    topology: self.name,
                    stage: stage.name().to_string(),
                });
            }
        }
        Ok(Topology {
            name: self.name,
            partitions: self.partitions,
            chained: self.chained,
            stages: self.stages,
            stage_metadata: self.stage_metadata,
        })
    }
}

/// A named, ordered chain of stages.
///
/// Every stage consumes from its own topic, `"<topology>.<stage>"`, split
/// into the same number of partitions.
pub struct Topology {
    name: String,
    partitions: u32,
    chained: bool,
    stages: Vec<Arc<dyn Stage>>,
    stage_metadata: Vec<Metadata>,
}

impl Topology {
    /// Create a new topology builder with the given name.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(name: impl Into<String>) -> TopologyBuilder {
        TopologyBuilder {
            name: name.into(),
            partitions: DEFAULT_PARTITIONS,
            chained: false,
            stages: Vec::new(),
            stage_metadata: Vec::new(),
        }
    }

    /// Builder named and partitioned after `config`.
    pub fn from_config(config: &TopologyConfig) -> TopologyBuilder {
        Self::new(config.name.clone())
            .partitions(config.partitions)
            .chained(config.chained)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Whether tasks expect as many records as their previous task forwarded.
    pub fn is_chained(&self) -> bool {
        self.chained
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Topic the stage at `index` consumes from.
    pub fn topic_for(&self, index: usize) -> Option<String> {
        self.stages
            .get(index)
            .map(|stage| stage_topic(&self.name, stage.name()))
    }

    /// Topic new records are published to.
    pub fn entry_topic(&self) -> String {
        stage_topic(&self.name, self.stages[0].name())
    }

    /// Partition a record travels on, from its routing key.
    pub fn partition_for(&self, envelope: &RecordEnvelope) -> u32 {
        bucket_number(envelope.routing_key(), self.partitions)
    }

    /// Run every stage in order on one record and return the final outcome.
    ///
    /// Stops at the first stage that does not forward the record. A record
    /// that passes every stage comes back as `Outcome::Forward`.
    pub async fn run_record(&self, mut envelope: RecordEnvelope) -> Outcome {
        for stage in &self.stages {
            match run_stage(stage.as_ref(), envelope).await {
                Outcome::Forward(next) => envelope = next,
                terminal => {
                    trace!(
                        topology = %self.name,
                        stage = stage.name(),
                        outcome = terminal.kind(),
                        "Record left the topology"
                    );
                    return terminal;
                }
            }
        }
        Outcome::Forward(envelope)
    }

    /// Export the topology structure as a graph for visualization.
    pub fn to_graph(&self) -> TopologyGraph {
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| StageNode {
                name: stage.name().to_string(),
                index,
                topic: stage_topic(&self.name, stage.name()),
                metadata: self.stage_metadata.get(index).cloned().unwrap_or_default(),
            })
            .collect();

        TopologyGraph {
            name: self.name.clone(),
            partitions: self.partitions,
            stages,
        }
    }
}
