//! In-memory implementation of BucketStore.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{new_bucket_id, Bucket, BucketStore};
use crate::error::StoreError;

/// Buckets kept in process memory, in allocation order per object.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, Vec<Bucket>>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn current(&self, object_id: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(self
            .buckets
            .lock()
            .await
            .get(object_id)
            .and_then(|b| b.last())
            .cloned())
    }

    async fn allocate(&self, object_id: &str) -> Result<Bucket, StoreError> {
        let bucket = Bucket {
            object_id: object_id.to_string(),
            bucket_id: new_bucket_id(),
            rows_count: 0,
        };
        self.buckets
            .lock()
            .await
            .entry(object_id.to_string())
            .or_default()
            .push(bucket.clone());
        Ok(bucket)
    }

    async fn increment(&self, object_id: &str, bucket_id: &str, rows: u64) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .get_mut(object_id)
            .and_then(|b| b.iter_mut().find(|b| b.bucket_id == bucket_id))
            .ok_or_else(|| StoreError::Storage(format!("unknown bucket {bucket_id} of {object_id}")))?;
        bucket.rows_count += rows;
        Ok(())
    }

    async fn buckets(&self, object_id: &str) -> Result<Vec<Bucket>, StoreError> {
        Ok(self
            .buckets
            .lock()
            .await
            .get(object_id)
            .cloned()
            .unwrap_or_default())
    }
}
