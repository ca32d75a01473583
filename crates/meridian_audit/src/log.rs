//! The audit log proper: monthly partitions, chained writes, verification.

use crate::canonical::entry_hash;
use chrono::{DateTime, SecondsFormat, Utc};
use meridian_db::{Partition, Store, StoreError};
use meridian_protocol::{AuditActor, AuditEntry, RiskLevel};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit entry not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt audit row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

/// Options for one audit write.
#[derive(Debug, Clone)]
pub struct WriteAudit {
    pub actor: AuditActor,
    pub actor_id: Option<String>,
    pub action: String,
    pub risk_level: RiskLevel,
    pub target: Option<String>,
    pub job_id: Option<String>,
    pub details: Option<Value>,
}

impl WriteAudit {
    pub fn new(actor: AuditActor, action: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            actor,
            actor_id: None,
            action: action.into(),
            risk_level,
            target: None,
            job_id: None,
            details: None,
        }
    }

    pub fn job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Query filters. All optional; absent filters match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<AuditActor>,
    pub action: Option<String>,
    pub job_id: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AuditExport {
    pub entry_count: usize,
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BrokenLink {
    pub entry_id: String,
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<BrokenLink>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_entries (
    id            TEXT PRIMARY KEY,
    timestamp     TEXT NOT NULL,
    actor         TEXT NOT NULL,
    actor_id      TEXT,
    action        TEXT NOT NULL,
    risk_level    TEXT NOT NULL,
    target        TEXT,
    job_id        TEXT,
    details       TEXT,
    previous_hash TEXT,
    entry_hash    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_entries_chain
    ON audit_entries(timestamp, id);
CREATE INDEX IF NOT EXISTS idx_audit_entries_job
    ON audit_entries(job_id);
"#;

/// Append-only audit log over monthly store partitions.
#[derive(Clone)]
pub struct AuditLog {
    store: Store,
    initialized: Arc<Mutex<HashSet<String>>>,
    /// Serializes lookup-then-insert so concurrent writers never fork the chain.
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            initialized: Arc::new(Mutex::new(HashSet::new())),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The partition key for a timestamp: `YYYY-MM` in UTC.
    pub fn month_key(ts: DateTime<Utc>) -> String {
        ts.format("%Y-%m").to_string()
    }

    async fn partition_for(&self, month: Option<&str>) -> Result<Partition, AuditError> {
        let month = match month {
            Some(m) => m.to_string(),
            None => Self::month_key(Utc::now()),
        };
        let partition = Partition::audit(month.clone())?;
        let mut initialized = self.initialized.lock().await;
        if !initialized.contains(&month) {
            self.store.exec(&partition, SCHEMA).await?;
            initialized.insert(month);
        }
        Ok(partition)
    }

    /// Append one entry to the current month's chain.
    pub async fn write(&self, options: WriteAudit) -> Result<AuditEntry, AuditError> {
        // Microsecond precision end to end: the stored string, the hashed
        // canonical form, and the returned entry must all agree.
        let mut timestamp = truncate_to_micros(Utc::now());
        let partition = self.partition_for(Some(&Self::month_key(timestamp))).await?;
        let pool = self.store.pool(&partition).await?;

        let _guard = self.write_lock.lock().await;

        let last: Option<(String, String)> = sqlx::query_as(
            "SELECT timestamp, entry_hash FROM audit_entries ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&pool)
        .await?;

        let previous_hash = match last {
            Some((last_ts, hash)) => {
                // Keep partition order strictly monotone even when two writes
                // land in the same microsecond.
                if let Ok(last_ts) = DateTime::parse_from_rfc3339(&last_ts) {
                    let last_ts = last_ts.with_timezone(&Utc);
                    if timestamp <= last_ts {
                        timestamp = last_ts + chrono::Duration::microseconds(1);
                    }
                }
                Some(hash)
            }
            None => None,
        };

        let mut entry = AuditEntry {
            id: Uuid::now_v7().to_string(),
            timestamp,
            actor: options.actor,
            actor_id: options.actor_id,
            action: options.action,
            risk_level: options.risk_level,
            target: options.target,
            job_id: options.job_id,
            details: options.details,
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry_hash(&entry);

        sqlx::query(
            r#"
            INSERT INTO audit_entries
                (id, timestamp, actor, actor_id, action, risk_level, target,
                 job_id, details, previous_hash, entry_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(entry.actor.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.action)
        .bind(entry.risk_level.as_str())
        .bind(&entry.target)
        .bind(&entry.job_id)
        .bind(entry.details.as_ref().map(|d| d.to_string()))
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&pool)
        .await?;

        debug!(action = %entry.action, id = %entry.id, "audit entry written");
        Ok(entry)
    }

    /// Entries matching the filter, in chain order.
    pub async fn query(
        &self,
        filter: &AuditFilter,
        month: Option<&str>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let partition = self.partition_for(month).await?;
        let pool = self.store.pool(&partition).await?;

        let mut sql = String::from("SELECT * FROM audit_entries WHERE 1=1");
        if filter.actor.is_some() {
            sql.push_str(" AND actor = ?");
        }
        if filter.action.is_some() {
            sql.push_str(" AND action = ?");
        }
        if filter.job_id.is_some() {
            sql.push_str(" AND job_id = ?");
        }
        if filter.risk_level.is_some() {
            sql.push_str(" AND risk_level = ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(actor) = filter.actor {
            query = query.bind(actor.as_str());
        }
        if let Some(action) = &filter.action {
            query = query.bind(action);
        }
        if let Some(job_id) = &filter.job_id {
            query = query.bind(job_id);
        }
        if let Some(risk) = filter.risk_level {
            query = query.bind(risk.as_str());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&pool).await?;
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn get_by_id(
        &self,
        id: &str,
        month: Option<&str>,
    ) -> Result<AuditEntry, AuditError> {
        let partition = self.partition_for(month).await?;
        let pool = self.store.pool(&partition).await?;
        let row = sqlx::query("SELECT * FROM audit_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        match row {
            Some(row) => row_to_entry(&row),
            None => Err(AuditError::NotFound(id.to_string())),
        }
    }

    pub async fn count(
        &self,
        filter: &AuditFilter,
        month: Option<&str>,
    ) -> Result<i64, AuditError> {
        // Counting through query keeps the filter logic in one place; audit
        // partitions are month-bounded so the row sets stay small.
        Ok(self.query(filter, month).await?.len() as i64)
    }

    pub async fn export(&self, month: Option<&str>) -> Result<AuditExport, AuditError> {
        let entries = self.query(&AuditFilter::default(), month).await?;
        Ok(AuditExport {
            entry_count: entries.len(),
            entries,
        })
    }

    /// Walk the partition in chain order, checking linkage and recomputing
    /// every hash. Returns the first break found.
    pub async fn verify_chain(
        &self,
        month: Option<&str>,
    ) -> Result<ChainVerification, AuditError> {
        let entries = self.query(&AuditFilter::default(), month).await?;

        let mut previous: Option<&str> = None;
        for (index, entry) in entries.iter().enumerate() {
            if entry.previous_hash.as_deref() != previous {
                return Ok(ChainVerification {
                    valid: false,
                    entries_checked: index + 1,
                    broken_at: Some(BrokenLink {
                        entry_id: entry.id.clone(),
                        index,
                        reason: format!(
                            "previousHash mismatch: expected {:?}, found {:?}",
                            previous, entry.previous_hash
                        ),
                    }),
                });
            }
            let recomputed = entry_hash(entry);
            if recomputed != entry.entry_hash {
                return Ok(ChainVerification {
                    valid: false,
                    entries_checked: index + 1,
                    broken_at: Some(BrokenLink {
                        entry_id: entry.id.clone(),
                        index,
                        reason: format!(
                            "entryHash mismatch: recomputed {} but row holds {}",
                            recomputed, entry.entry_hash
                        ),
                    }),
                });
            }
            previous = Some(entry.entry_hash.as_str());
        }

        Ok(ChainVerification {
            valid: true,
            entries_checked: entries.len(),
            broken_at: None,
        })
    }
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let excess = (ts.timestamp_subsec_nanos() % 1_000) as i64;
    ts - chrono::Duration::nanoseconds(excess)
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry, AuditError> {
    let id: String = row.get("id");
    let corrupt = |reason: String| AuditError::CorruptRow {
        id: id.clone(),
        reason,
    };

    let timestamp_raw: String = row.get("timestamp");
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map_err(|e| corrupt(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);
    let actor = AuditActor::from_str(row.get::<String, _>("actor").as_str()).map_err(corrupt)?;
    let risk_level =
        RiskLevel::from_str(row.get::<String, _>("risk_level").as_str()).map_err(corrupt)?;
    let details = match row.get::<Option<String>, _>("details") {
        Some(raw) => {
            Some(serde_json::from_str(&raw).map_err(|e| corrupt(format!("bad details: {e}")))?)
        }
        None => None,
    };

    Ok(AuditEntry {
        id,
        timestamp,
        actor,
        actor_id: row.get("actor_id"),
        action: row.get("action"),
        risk_level,
        target: row.get("target"),
        job_id: row.get("job_id"),
        details,
        previous_hash: row.get("previous_hash"),
        entry_hash: row.get("entry_hash"),
    })
}
