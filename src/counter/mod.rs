//! Bucketed counters.
//!
//! A logical object (say, every record written to one dataset) can receive
//! far more writes than a single row should absorb. Its rows are spread over
//! buckets of bounded size: writes go to the newest bucket until it is full,
//! then a fresh bucket takes over. Buckets are never merged or split.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use memory::InMemoryBucketStore;

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteBucketStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreError;

/// Rows a bucket takes before a new one is allocated.
pub const DEFAULT_BUCKET_CAPACITY: u64 = 100_000;

/// One shard of an object's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub object_id: String,
    pub bucket_id: String,
    pub rows_count: u64,
}

/// Trait for bucket storage backends.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// The most recently allocated bucket of an object.
    async fn current(&self, object_id: &str) -> Result<Option<Bucket>, StoreError>;

    /// Allocate a new, empty bucket that becomes the current one.
    async fn allocate(&self, object_id: &str) -> Result<Bucket, StoreError>;

    /// Atomically add `rows` to a bucket's count.
    async fn increment(&self, object_id: &str, bucket_id: &str, rows: u64) -> Result<(), StoreError>;

    /// All buckets of an object, oldest first.
    async fn buckets(&self, object_id: &str) -> Result<Vec<Bucket>, StoreError>;
}

/// Object id under which a dataset's rows are counted.
pub fn dataset_object_id(provider_id: &str, dataset_id: &str) -> String {
    format!("{provider_id}{dataset_id}")
}

/// Fresh opaque bucket token.
pub(crate) fn new_bucket_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Counts rows per object across capacity-bounded buckets.
#[derive(Clone)]
pub struct BucketedCounter {
    store: Arc<dyn BucketStore>,
    capacity: u64,
}

impl BucketedCounter {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(store: Arc<dyn BucketStore>, capacity: u64) -> Self {
        assert!(capacity > 0, "bucket capacity must be at least 1");
        Self { store, capacity }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Record one row for `object_id` and return the bucket it went to.
    ///
    /// Two writers racing on the last free slot may both land in the same
    /// bucket and push it one past capacity; no write is ever dropped.
    pub async fn add_row(&self, object_id: &str) -> Result<Bucket, StoreError> {
        let mut bucket = match self.store.current(object_id).await? {
            Some(bucket) if bucket.rows_count < self.capacity => bucket,
            full => {
                let bucket = self.store.allocate(object_id).await?;
                debug!(
                    object_id,
                    bucket_id = %bucket.bucket_id,
                    previous = full.as_ref().map(|b| b.bucket_id.as_str()),
                    "Allocated bucket"
                );
                bucket
            }
        };
        self.store.increment(object_id, &bucket.bucket_id, 1).await?;
        bucket.rows_count += 1;
        Ok(bucket)
    }

    /// Total rows recorded for `object_id`.
    pub async fn total(&self, object_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .store
            .buckets(object_id)
            .await?
            .iter()
            .map(|b| b.rows_count)
            .sum())
    }

    pub async fn buckets(&self, object_id: &str) -> Result<Vec<Bucket>, StoreError> {
        self.store.buckets(object_id).await
    }
}
