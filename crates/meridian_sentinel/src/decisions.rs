//! Decision memory: memoised allow/deny verdicts in the sentinel partition.
//!
//! Cap-bounded - the oldest rows are evicted beyond the cap. Shell action
//! types are forbidden: a shell decision is never memoised.

use chrono::{SecondsFormat, Utc};
use meridian_db::{Partition, Store, StoreError};
use meridian_protocol::{Decision, DecisionVerdict};
use sqlx::Row;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DecisionMemoryError {
    #[error("shell decisions are never memoised (got '{0}')")]
    ShellForbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt decision row: {0}")]
    Corrupt(String),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type TEXT NOT NULL,
    scope       TEXT NOT NULL,
    verdict     TEXT NOT NULL,
    expires_at  TEXT,
    metadata    TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL,
    UNIQUE (action_type, scope)
);
"#;

/// Cap-bounded decision store over the sentinel partition.
#[derive(Clone)]
pub struct DecisionMemory {
    store: Store,
    cap: i64,
}

impl DecisionMemory {
    pub async fn open(store: Store, cap: i64) -> Result<Self, DecisionMemoryError> {
        store.exec(&Partition::Sentinel, SCHEMA).await?;
        Ok(Self { store, cap })
    }

    /// Memoise a decision. Re-recording an `(action_type, scope)` pair
    /// replaces the previous verdict.
    pub async fn record(&self, decision: &Decision) -> Result<(), DecisionMemoryError> {
        if decision.action_type.starts_with("shell.") || decision.action_type == "shell" {
            return Err(DecisionMemoryError::ShellForbidden(
                decision.action_type.clone(),
            ));
        }

        let pool = self.store.pool(&Partition::Sentinel).await?;
        sqlx::query(
            r#"
            INSERT INTO decisions (action_type, scope, verdict, expires_at, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (action_type, scope) DO UPDATE SET
                verdict = excluded.verdict,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata,
                created_at = excluded.created_at
            "#,
        )
        .bind(&decision.action_type)
        .bind(&decision.scope)
        .bind(decision.verdict.as_str())
        .bind(
            decision
                .expires_at
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        )
        .bind(serde_json::to_string(&decision.metadata).unwrap_or_else(|_| "{}".to_string()))
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&pool)
        .await?;

        // Evict oldest rows beyond the cap.
        let evicted = sqlx::query(
            r#"
            DELETE FROM decisions WHERE id IN (
                SELECT id FROM decisions ORDER BY id DESC LIMIT -1 OFFSET ?
            )
            "#,
        )
        .bind(self.cap)
        .execute(&pool)
        .await?
        .rows_affected();
        if evicted > 0 {
            debug!(evicted, "evicted decisions beyond cap");
        }
        Ok(())
    }

    /// Look up a memoised decision. Expired rows are ignored.
    pub async fn lookup(
        &self,
        action_type: &str,
        scope: &str,
    ) -> Result<Option<Decision>, DecisionMemoryError> {
        let pool = self.store.pool(&Partition::Sentinel).await?;
        let row = sqlx::query(
            "SELECT action_type, scope, verdict, expires_at, metadata FROM decisions
             WHERE action_type = ? AND scope = ?",
        )
        .bind(action_type)
        .bind(scope)
        .fetch_optional(&pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let expires_at = match row.get::<Option<String>, _>("expires_at") {
            Some(raw) => {
                let ts = chrono::DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| DecisionMemoryError::Corrupt(e.to_string()))?
                    .with_timezone(&Utc);
                if ts <= Utc::now() {
                    return Ok(None);
                }
                Some(ts)
            }
            None => None,
        };

        let verdict = DecisionVerdict::from_str(row.get::<String, _>("verdict").as_str())
            .map_err(DecisionMemoryError::Corrupt)?;
        let metadata = serde_json::from_str(row.get::<String, _>("metadata").as_str())
            .map_err(|e| DecisionMemoryError::Corrupt(e.to_string()))?;

        Ok(Some(Decision {
            action_type: row.get("action_type"),
            scope: row.get("scope"),
            verdict,
            expires_at,
            metadata,
        }))
    }

    pub async fn len(&self) -> Result<i64, DecisionMemoryError> {
        let pool = self.store.pool(&Partition::Sentinel).await?;
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM decisions")
            .fetch_one(&pool)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use meridian_protocol::DataDir;
    use std::collections::HashMap;

    async fn memory(cap: i64) -> (tempfile::TempDir, DecisionMemory) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(DataDir::new(dir.path()));
        let memory = DecisionMemory::open(store, cap).await.unwrap();
        (dir, memory)
    }

    fn decision(action_type: &str, scope: &str, verdict: DecisionVerdict) -> Decision {
        Decision {
            action_type: action_type.to_string(),
            scope: scope.to_string(),
            verdict,
            expires_at: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn record_and_lookup() {
        let (_dir, memory) = memory(10).await;
        memory
            .record(&decision("network_get", "example.com", DecisionVerdict::Allow))
            .await
            .unwrap();
        let found = memory.lookup("network_get", "example.com").await.unwrap().unwrap();
        assert_eq!(found.verdict, DecisionVerdict::Allow);
        assert!(memory.lookup("network_get", "other.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shell_decisions_are_forbidden() {
        let (_dir, memory) = memory(10).await;
        let err = memory
            .record(&decision("shell.execute", "*", DecisionVerdict::Allow))
            .await
            .unwrap_err();
        assert!(matches!(err, DecisionMemoryError::ShellForbidden(_)));
        assert_eq!(memory.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cap_evicts_oldest() {
        let (_dir, memory) = memory(3).await;
        for i in 0..5 {
            memory
                .record(&decision("network_get", &format!("host{i}.com"), DecisionVerdict::Allow))
                .await
                .unwrap();
        }
        assert_eq!(memory.len().await.unwrap(), 3);
        // The two oldest are gone; the newest survive.
        assert!(memory.lookup("network_get", "host0.com").await.unwrap().is_none());
        assert!(memory.lookup("network_get", "host4.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_decisions_are_ignored() {
        let (_dir, memory) = memory(10).await;
        let mut d = decision("network_get", "stale.com", DecisionVerdict::Deny);
        d.expires_at = Some(Utc::now() - Duration::seconds(1));
        memory.record(&d).await.unwrap();
        assert!(memory.lookup("network_get", "stale.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rerecord_replaces_verdict() {
        let (_dir, memory) = memory(10).await;
        memory
            .record(&decision("send_message", "slack", DecisionVerdict::Allow))
            .await
            .unwrap();
        memory
            .record(&decision("send_message", "slack", DecisionVerdict::Deny))
            .await
            .unwrap();
        let found = memory.lookup("send_message", "slack").await.unwrap().unwrap();
        assert_eq!(found.verdict, DecisionVerdict::Deny);
        assert_eq!(memory.len().await.unwrap(), 1);
    }
}
