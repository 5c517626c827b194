//! Runtime configuration.
//!
//! Every section has defaults, so an empty JSON object is a valid config.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Backoff shape for [`RetryConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        match (self.max_retries, self.backoff) {
            (0, _) => RetryPolicy::None,
            (n, Backoff::Fixed) => RetryPolicy::fixed(n, delay),
            (n, Backoff::Exponential) => RetryPolicy::Exponential {
                max_retries: n,
                initial_delay: delay,
                max_delay: Duration::from_secs(300),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopologyConfig {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Expected counts come from a previous task instead of the input.
    #[serde(default)]
    pub chained: bool,
}

fn default_partitions() -> u32 {
    8
}

impl TopologyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: default_partitions(),
            chained: false,
        }
    }

    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn chained(mut self, chained: bool) -> Self {
        self.chained = chained;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            batch_size: 16,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub capacity: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { capacity: 100_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub run_on_start: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            run_on_start: true,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Indexing engine endpoints per target environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub environments: HashMap<String, String>,
}

impl IndexingConfig {
    pub fn with_environment(mut self, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.environments.insert(name.into(), endpoint.into());
        self
    }

    pub fn endpoint(&self, environment: &str) -> Option<&str> {
        self.environments.get(environment).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub topologies: Vec<TopologyConfig>,
    pub worker: WorkerConfig,
    pub buckets: BucketConfig,
    pub monitor: MonitorConfig,
    pub indexing: IndexingConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn topology(&self, name: &str) -> Option<&TopologyConfig> {
        self.topologies.iter().find(|t| t.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.topologies.iter().find(|t| t.partitions == 0) {
            return Err(ConfigError::Invalid(format!(
                "topology {} must have at least one partition",
                t.name
            )));
        }
        if self.buckets.capacity == 0 {
            return Err(ConfigError::Invalid("bucket capacity must be positive".into()));
        }
        if self.worker.batch_size == 0 {
            return Err(ConfigError::Invalid("worker batch size must be positive".into()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("worker poll interval must be positive".into()));
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor interval must be positive".into()));
        }
        Ok(())
    }
}
