//! SQLite implementation of MessageQueue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool};

use super::store::{Delivery, MessageId, MessageQueue};
use crate::envelope::RecordEnvelope;
use crate::error::StoreError;

/// SQLite-backed message queue.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    /// Create a new SqliteQueue.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the messages table.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                topic TEXT NOT NULL,
                partition_no INTEGER NOT NULL,
                envelope TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                claimed_at TEXT,
                acked_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_partition
            ON messages(topic, partition_no, status, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn publish(
        &self,
        topic: &str,
        partition: u32,
        envelope: &RecordEnvelope,
    ) -> Result<MessageId, StoreError> {
        let body =
            serde_json::to_string(envelope).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO messages (topic, partition_no, envelope)
            VALUES (?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(topic)
        .bind(i64::from(partition))
        .bind(body)
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageId(id))
    }

    async fn claim(&self, topic: &str, partition: u32, limit: usize) -> Result<Vec<Delivery>, StoreError> {
        // Pick, mark and read back in one transaction so two workers never
        // claim the same message
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM messages
            WHERE topic = ? AND partition_no = ? AND status = 'pending'
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(i64::from(partition))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        let in_clause = vec!["?"; ids.len()].join(",");

        let mark = format!(
            "UPDATE messages SET status = 'in_flight', attempts = attempts + 1, \
             claimed_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id IN ({in_clause})"
        );
        ids.iter()
            .fold(sqlx::query::<Sqlite>(&mark), |q, id| q.bind(id))
            .execute(&mut *tx)
            .await?;

        let read_back = format!(
            "SELECT id, envelope, attempts, created_at FROM messages WHERE id IN ({in_clause}) ORDER BY id"
        );
        let rows = ids
            .iter()
            .fold(
                sqlx::query_as::<Sqlite, (i64, String, i64, String)>(&read_back),
                |q, id| q.bind(id),
            )
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        rows.into_iter()
            .map(|(id, body, attempts, created_at)| {
                let envelope: RecordEnvelope = serde_json::from_str(&body)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Ok(Delivery {
                    id: MessageId(id),
                    topic: topic.to_string(),
                    partition,
                    envelope,
                    attempts: attempts.max(0) as u32,
                    created_at,
                })
            })
            .collect()
    }

    async fn ack(&self, id: MessageId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'acked', acked_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release(&self, id: MessageId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'pending', claimed_at = NULL
            WHERE id = ? AND status = 'in_flight'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recover_in_flight(&self, topic: &str) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'in_flight' AND topic = ?
            "#,
        )
        .bind(topic)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn outstanding(&self, topic: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE topic = ? AND status IN ('pending', 'in_flight')",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }
}
