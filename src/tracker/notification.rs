//! Per-record notification stream consumed by reporting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::step::RecordError;
use crate::task::TaskId;

/// Final state of a record as reported on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    Error,
    Deleted,
}

impl RecordState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Deleted => "DELETED",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "ERROR" => Ok(Self::Error),
            "DELETED" => Ok(Self::Deleted),
            other => Err(StoreError::Deserialization(format!("unknown record state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: TaskId,
    pub resource: String,
    pub state: RecordState,
    pub info_text: String,
    pub additional_info: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn error(err: &RecordError) -> Self {
        Self {
            task_id: err.task_id,
            resource: err.resource.clone(),
            state: RecordState::Error,
            info_text: err.message.clone(),
            additional_info: err.additional_info.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn deleted(task_id: TaskId, resource: &str) -> Self {
        Self {
            task_id,
            resource: resource.to_string(),
            state: RecordState::Deleted,
            info_text: "Record removed".to_string(),
            additional_info: String::new(),
            created_at: Utc::now(),
        }
    }
}

/// Destination for record notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), StoreError>;

    /// Notifications of one task in emission order.
    async fn list_for_task(&self, task_id: TaskId) -> Result<Vec<Notification>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryNotifications {
    entries: Mutex<Vec<Notification>>,
}

impl InMemoryNotifications {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotifications {
    async fn notify(&self, notification: Notification) -> Result<(), StoreError> {
        self.entries.lock().await.push(notification);
        Ok(())
    }

    async fn list_for_task(&self, task_id: TaskId) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|n| n.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteNotifications;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use sqlx::SqlitePool;

    /// SQLite-backed notification stream.
    #[derive(Clone)]
    pub struct SqliteNotifications {
        pool: SqlitePool,
    }

    impl SqliteNotifications {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        pub async fn run_migrations(&self) -> Result<(), StoreError> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY,
                    task_id INTEGER NOT NULL,
                    resource TEXT NOT NULL,
                    state TEXT NOT NULL,
                    info_text TEXT NOT NULL,
                    additional_info TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query("CREATE INDEX IF NOT EXISTS idx_notifications_task ON notifications(task_id, id)")
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationSink for SqliteNotifications {
        async fn notify(&self, notification: Notification) -> Result<(), StoreError> {
            sqlx::query(
                r#"
                INSERT INTO notifications (task_id, resource, state, info_text, additional_info, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(notification.task_id.0)
            .bind(&notification.resource)
            .bind(notification.state.as_str())
            .bind(&notification.info_text)
            .bind(&notification.additional_info)
            .bind(notification.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list_for_task(&self, task_id: TaskId) -> Result<Vec<Notification>, StoreError> {
            let rows = sqlx::query_as::<_, (String, String, String, String, String)>(
                r#"
                SELECT resource, state, info_text, additional_info, created_at
                FROM notifications WHERE task_id = ? ORDER BY id
                "#,
            )
            .bind(task_id.0)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|(resource, state, info_text, additional_info, created_at)| {
                    let created_at = DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                    Ok(Notification {
                        task_id,
                        resource,
                        state: RecordState::parse(&state)?,
                        info_text,
                        additional_info,
                        created_at,
                    })
                })
                .collect()
        }
    }
}
