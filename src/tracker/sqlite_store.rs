//! SQLite implementation of TaskInfoStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::store::{Counter, TaskInfoStore, ACTIVE_STATES, PROCESSED_DESCRIPTION};
use crate::error::StoreError;
use crate::task::{TaskId, TaskInfo, TaskState};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_info (
    id INTEGER PRIMARY KEY,
    topology_name TEXT NOT NULL,
    state TEXT NOT NULL,
    state_description TEXT NOT NULL DEFAULT '',
    owner TEXT,
    expected_records INTEGER NOT NULL DEFAULT -1,
    processed_records INTEGER NOT NULL DEFAULT 0,
    processed_errors INTEGER NOT NULL DEFAULT 0,
    deleted_records INTEGER NOT NULL DEFAULT 0,
    post_processed_records INTEGER NOT NULL DEFAULT 0,
    fatal_error TEXT,
    sent_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_info_state ON task_info(state, id)
"#;

const COLUMNS: &str = "id, topology_name, state, state_description, owner, expected_records, \
    processed_records, processed_errors, deleted_records, post_processed_records, fatal_error, \
    sent_at, started_at, finished_at";

/// SQLite-backed task info store.
#[derive(Clone)]
pub struct SqliteTaskInfoStore {
    pool: SqlitePool,
}

impl SqliteTaskInfoStore {
    /// Create a new SqliteTaskInfoStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the task_info table.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    async fn write(&self, info: &TaskInfo, verb: &str) -> Result<(), sqlx::Error> {
        let query = format!(
            "{verb} INTO task_info ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&query)
            .bind(info.id.0)
            .bind(&info.topology_name)
            .bind(info.state.as_str())
            .bind(&info.state_description)
            .bind(&info.owner)
            .bind(info.expected_records_number)
            .bind(info.processed_records_count)
            .bind(info.processed_errors_count)
            .bind(info.deleted_records_count)
            .bind(info.post_processed_records_count)
            .bind(&info.fatal_error)
            .bind(info.sent_timestamp.to_rfc3339())
            .bind(info.start_timestamp.map(|t| t.to_rfc3339()))
            .bind(info.finish_timestamp.map(|t| t.to_rfc3339()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Deserialization(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_optional_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_time).transpose()
}

fn row_to_info(row: &SqliteRow) -> Result<TaskInfo, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(TaskInfo {
        id: TaskId(row.try_get("id")?),
        topology_name: row.try_get("topology_name")?,
        state: state.parse().map_err(StoreError::Deserialization)?,
        state_description: row.try_get("state_description")?,
        owner: row.try_get("owner")?,
        expected_records_number: row.try_get("expected_records")?,
        processed_records_count: row.try_get("processed_records")?,
        processed_errors_count: row.try_get("processed_errors")?,
        deleted_records_count: row.try_get("deleted_records")?,
        post_processed_records_count: row.try_get("post_processed_records")?,
        fatal_error: row.try_get("fatal_error")?,
        sent_timestamp: parse_time(&row.try_get::<String, _>("sent_at")?)?,
        start_timestamp: parse_optional_time(row.try_get("started_at")?)?,
        finish_timestamp: parse_optional_time(row.try_get("finished_at")?)?,
    })
}

#[async_trait]
impl TaskInfoStore for SqliteTaskInfoStore {
    async fn insert(&self, info: &TaskInfo) -> Result<(), StoreError> {
        match self.write(info, "INSERT").await {
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(format!("task {}", info.id)))
            }
            other => other.map_err(Into::into),
        }
    }

    async fn upsert(&self, info: &TaskInfo) -> Result<(), StoreError> {
        self.write(info, "INSERT OR REPLACE").await?;
        Ok(())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskInfo>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM task_info WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_info).transpose()
    }

    async fn list_by_state(&self, states: &[TaskState]) -> Result<Vec<TaskInfo>, StoreError> {
        if states.is_empty() {
            return Ok(vec![]);
        }
        let query = format!(
            "SELECT {COLUMNS} FROM task_info WHERE state IN ({}) ORDER BY id",
            placeholders(states.len())
        );
        let mut select = sqlx::query(&query);
        for state in states {
            select = select.bind(state.as_str());
        }
        let rows = select.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_info).collect()
    }

    async fn increment(&self, id: TaskId, counter: Counter) -> Result<bool, StoreError> {
        let column = counter.column();
        let query = format!(
            "UPDATE task_info SET {column} = {column} + 1 WHERE id = ? AND state IN ({})",
            placeholders(ACTIVE_STATES.len())
        );
        let mut update = sqlx::query(&query).bind(id.0);
        for state in ACTIVE_STATES {
            update = update.bind(state.as_str());
        }
        let result = update.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_expected(&self, id: TaskId, expected: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_info SET expected_records = ? WHERE id = ?")
            .bind(expected)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: TaskId,
        from: &[TaskState],
        to: TaskState,
        description: &str,
    ) -> Result<bool, StoreError> {
        if from.is_empty() {
            return Ok(false);
        }
        let now = Utc::now().to_rfc3339();
        let started = (to == TaskState::CurrentlyProcessing).then(|| now.clone());
        let finished = to.is_terminal().then_some(now);

        let query = format!(
            r#"
            UPDATE task_info
            SET state = ?, state_description = ?,
                started_at = COALESCE(started_at, ?),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ? AND state IN ({})
            "#,
            placeholders(from.len())
        );
        let mut update = sqlx::query(&query)
            .bind(to.as_str())
            .bind(description)
            .bind(started)
            .bind(finished)
            .bind(id.0);
        for state in from {
            update = update.bind(state.as_str());
        }
        let result = update.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_fatal(&self, id: TaskId, reason: &str) -> Result<(), StoreError> {
        let query = format!(
            "UPDATE task_info SET fatal_error = COALESCE(fatal_error, ?) WHERE id = ? AND state IN ({})",
            placeholders(ACTIVE_STATES.len())
        );
        let mut update = sqlx::query(&query).bind(reason).bind(id.0);
        for state in ACTIVE_STATES {
            update = update.bind(state.as_str());
        }
        update.execute(&self.pool).await?;
        Ok(())
    }

    async fn complete_if_finished(&self, id: TaskId) -> Result<Option<TaskState>, StoreError> {
        let state: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE task_info
            SET state = CASE WHEN fatal_error IS NULL THEN 'PROCESSED' ELSE 'FAILED' END,
                state_description = COALESCE(fatal_error, ?),
                finished_at = ?
            WHERE id = ?
              AND state = 'CURRENTLY_PROCESSING'
              AND expected_records >= 0
              AND processed_records + processed_errors + deleted_records + post_processed_records
                  >= expected_records
            RETURNING state
            "#,
        )
        .bind(PROCESSED_DESCRIPTION)
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        state
            .map(|s| s.parse().map_err(StoreError::Deserialization))
            .transpose()
    }
}
