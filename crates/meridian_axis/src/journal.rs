//! Journal staging hooks.
//!
//! The core only stages memories; the external reflection pipeline promotes
//! or rejects them. Plans may opt out with `journal_skip`.

use crate::error::AxisError;
use chrono::{DateTime, SecondsFormat, Utc};
use meridian_db::{Partition, Store};
use meridian_protocol::{MemoryKind, StagedMemory};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS staged_memories (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    content     TEXT NOT NULL,
    job_id      TEXT,
    staged_at   TEXT NOT NULL,
    promoted_at TEXT,
    rejected_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_staged_memories_pending
    ON staged_memories(staged_at)
    WHERE promoted_at IS NULL AND rejected_at IS NULL;
"#;

fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct JournalStore {
    pool: SqlitePool,
}

impl JournalStore {
    pub async fn open(store: &Store) -> Result<Self, AxisError> {
        store.exec(&Partition::Journal, SCHEMA).await?;
        let pool = store.pool(&Partition::Journal).await?;
        Ok(Self { pool })
    }

    pub async fn stage(
        &self,
        kind: MemoryKind,
        content: Value,
        job_id: Option<&str>,
    ) -> Result<StagedMemory, AxisError> {
        let id = Uuid::now_v7().to_string();
        sqlx::query(
            "INSERT INTO staged_memories (id, kind, content, job_id, staged_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(content.to_string())
        .bind(job_id)
        .bind(now_str())
        .execute(&self.pool)
        .await?;
        self.get(&id).await
    }

    /// Promotion belongs to the external reflection pipeline.
    pub async fn promote(&self, id: &str) -> Result<bool, AxisError> {
        let rows = sqlx::query(
            "UPDATE staged_memories SET promoted_at = ?
             WHERE id = ? AND promoted_at IS NULL AND rejected_at IS NULL",
        )
        .bind(now_str())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn reject(&self, id: &str) -> Result<bool, AxisError> {
        let rows = sqlx::query(
            "UPDATE staged_memories SET rejected_at = ?
             WHERE id = ? AND promoted_at IS NULL AND rejected_at IS NULL",
        )
        .bind(now_str())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn pending(&self) -> Result<Vec<StagedMemory>, AxisError> {
        let rows = sqlx::query(
            "SELECT * FROM staged_memories
             WHERE promoted_at IS NULL AND rejected_at IS NULL
             ORDER BY staged_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_memory).collect()
    }

    pub async fn get(&self, id: &str) -> Result<StagedMemory, AxisError> {
        let row = sqlx::query("SELECT * FROM staged_memories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_memory(&row),
            None => Err(AxisError::NotFound(format!("staged memory {id}"))),
        }
    }
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, AxisError> {
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| AxisError::Internal(format!("bad timestamp: {e}")))
    })
    .transpose()
}

fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> Result<StagedMemory, AxisError> {
    Ok(StagedMemory {
        id: row.get("id"),
        kind: MemoryKind::from_str(row.get::<String, _>("kind").as_str())
            .map_err(AxisError::Internal)?,
        content: serde_json::from_str(row.get::<String, _>("content").as_str())?,
        job_id: row.get("job_id"),
        staged_at: parse_ts_opt(Some(row.get("staged_at")))?
            .ok_or_else(|| AxisError::Internal("missing staged_at".to_string()))?,
        promoted_at: parse_ts_opt(row.get("promoted_at"))?,
        rejected_at: parse_ts_opt(row.get("rejected_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_protocol::DataDir;
    use serde_json::json;

    async fn journal() -> (tempfile::TempDir, JournalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(DataDir::new(dir.path()));
        let journal = JournalStore::open(&store).await.unwrap();
        (dir, journal)
    }

    #[tokio::test]
    async fn stage_then_promote() {
        let (_dir, journal) = journal().await;
        let staged = journal
            .stage(MemoryKind::Episodic, json!({"summary": "did a thing"}), Some("job-1"))
            .await
            .unwrap();
        assert!(staged.promoted_at.is_none());
        assert_eq!(journal.pending().await.unwrap().len(), 1);

        assert!(journal.promote(&staged.id).await.unwrap());
        assert!(journal.pending().await.unwrap().is_empty());
        // Promotion is one-shot.
        assert!(!journal.promote(&staged.id).await.unwrap());
        assert!(!journal.reject(&staged.id).await.unwrap());
    }

    #[tokio::test]
    async fn reject_removes_from_pending() {
        let (_dir, journal) = journal().await;
        let staged = journal
            .stage(MemoryKind::Semantic, json!("fact"), None)
            .await
            .unwrap();
        assert!(journal.reject(&staged.id).await.unwrap());
        let fetched = journal.get(&staged.id).await.unwrap();
        assert!(fetched.rejected_at.is_some());
        assert!(journal.pending().await.unwrap().is_empty());
    }
}
