//! SQLite implementation of BucketStore.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{new_bucket_id, Bucket, BucketStore};
use crate::error::StoreError;

/// SQLite-backed bucket store.
#[derive(Clone)]
pub struct SqliteBucketStore {
    pool: SqlitePool,
}

impl SqliteBucketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the buckets table.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id TEXT NOT NULL,
                bucket_id TEXT NOT NULL,
                rows_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE (object_id, bucket_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_buckets_object ON buckets(object_id, seq)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn to_bucket((object_id, bucket_id, rows_count): (String, String, i64)) -> Bucket {
    Bucket {
        object_id,
        bucket_id,
        rows_count: rows_count.max(0) as u64,
    }
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn current(&self, object_id: &str) -> Result<Option<Bucket>, StoreError> {
        let row = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT object_id, bucket_id, rows_count FROM buckets
            WHERE object_id = ?
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(to_bucket))
    }

    async fn allocate(&self, object_id: &str) -> Result<Bucket, StoreError> {
        let bucket_id = new_bucket_id();
        sqlx::query("INSERT INTO buckets (object_id, bucket_id) VALUES (?, ?)")
            .bind(object_id)
            .bind(&bucket_id)
            .execute(&self.pool)
            .await?;
        Ok(Bucket {
            object_id: object_id.to_string(),
            bucket_id,
            rows_count: 0,
        })
    }

    async fn increment(&self, object_id: &str, bucket_id: &str, rows: u64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE buckets SET rows_count = rows_count + ? WHERE object_id = ? AND bucket_id = ?",
        )
        .bind(rows as i64)
        .bind(object_id)
        .bind(bucket_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Storage(format!(
                "unknown bucket {bucket_id} of {object_id}"
            )));
        }
        Ok(())
    }

    async fn buckets(&self, object_id: &str) -> Result<Vec<Bucket>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT object_id, bucket_id, rows_count FROM buckets WHERE object_id = ? ORDER BY seq",
        )
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(to_bucket).collect())
    }
}
