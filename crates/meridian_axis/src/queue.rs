//! The job queue: CAS-guarded state machine over the primary partition.
//!
//! Only this component mutates job rows. Every transition is a conditional
//! UPDATE with the expected `from` status in the WHERE clause - a miss means
//! another worker won, and the caller re-reads. Claims pick the oldest
//! pending job of the highest priority inside one transaction.

use crate::error::AxisError;
use chrono::{DateTime, SecondsFormat, Utc};
use meridian_db::{Partition, Store};
use meridian_protocol::defaults::{MAX_REPLANS, MAX_REVISIONS};
use meridian_protocol::{
    dedup_hash, ChatMessage, ChatRole, Conversation, ConversationStatus, CreateJob, ErrorInfo,
    ExecutionPlan, Job, JobResult, JobSource, JobStatus, Priority, ValidationResult,
};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Emitted on every successful status change.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Optional payloads attached atomically with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub plan: Option<ExecutionPlan>,
    pub validation: Option<ValidationResult>,
    pub result: Option<JobResult>,
    pub error: Option<ErrorInfo>,
    pub worker_id: Option<String>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl TransitionUpdate {
    pub fn with_plan(plan: ExecutionPlan) -> Self {
        Self {
            plan: Some(plan),
            ..Default::default()
        }
    }

    pub fn with_validation(validation: ValidationResult) -> Self {
        Self {
            validation: Some(validation),
            ..Default::default()
        }
    }

    pub fn with_result(result: JobResult) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn with_error(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 1,
    source          TEXT NOT NULL,
    conversation_id TEXT,
    parent_id       TEXT,
    user_id         TEXT,
    content         TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL DEFAULT 3,
    timeout_ms      INTEGER NOT NULL DEFAULT 600000,
    revision_count  INTEGER NOT NULL DEFAULT 0,
    replan_count    INTEGER NOT NULL DEFAULT 0,
    worker_id       TEXT,
    plan            TEXT,
    validation      TEXT,
    result          TEXT,
    error           TEXT,
    dedup_hash      TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    completed_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs(status, priority DESC, created_at ASC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_dedup
    ON jobs(dedup_hash)
    WHERE dedup_hash IS NOT NULL
      AND status NOT IN ('completed', 'failed', 'cancelled');
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_conversation
    ON jobs(conversation_id)
    WHERE conversation_id IS NOT NULL
      AND status NOT IN ('completed', 'failed', 'cancelled');

CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY,
    status     TEXT NOT NULL DEFAULT 'active',
    title      TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS execution_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id       TEXT NOT NULL,
    step_id      TEXT NOT NULL,
    gear         TEXT NOT NULL,
    action       TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'started',
    error        TEXT,
    started_at   TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_execution_log_job
    ON execution_log(job_id, status);
"#;

fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Queue over the primary partition. Cloning shares the pool and the event
/// channel.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    dedup_window_ms: i64,
    events: broadcast::Sender<StatusChange>,
}

impl JobQueue {
    /// Open the primary partition and ensure the schema.
    pub async fn open(store: &Store, dedup_window_ms: i64) -> Result<Self, AxisError> {
        store.exec(&Partition::Primary, SCHEMA).await?;
        let pool = store.pool(&Partition::Primary).await?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            pool,
            dedup_window_ms,
            events,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    fn emit(&self, change: StatusChange) {
        // Nobody listening is fine.
        let _ = self.events.send(change);
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a job. A duplicate user message inside the dedup window
    /// returns the prior job unchanged.
    pub async fn create_job(&self, options: CreateJob) -> Result<Job, AxisError> {
        let dedup = match options.source {
            JobSource::User => Some(dedup_hash(
                options.user_id.as_deref().unwrap_or_default(),
                &options.content,
                Utc::now().timestamp_millis(),
                self.dedup_window_ms,
            )),
            _ => None,
        };

        if let Some(hash) = &dedup {
            if let Some(prior) = self.find_live_by_dedup(hash).await? {
                debug!(job_id = %prior.id, "dedup hit, returning prior job");
                return Ok(prior);
            }
        }

        let id = Uuid::now_v7().to_string();
        let now = now_str();
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs
                (id, status, priority, source, conversation_id, parent_id, user_id,
                 content, max_attempts, timeout_ms, dedup_hash, metadata,
                 created_at, updated_at)
            VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(options.priority.as_i64())
        .bind(options.source.as_str())
        .bind(&options.conversation_id)
        .bind(&options.parent_id)
        .bind(&options.user_id)
        .bind(&options.content)
        .bind(options.max_attempts)
        .bind(options.timeout_ms)
        .bind(&dedup)
        .bind(serde_json::to_string(&options.metadata)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                info!(job_id = %id, source = %options.source.as_str(), "job created");
                self.get_job(&id).await
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // Either a dedup collision that raced our pre-check, or a
                // second live job for the same conversation.
                if let Some(hash) = &dedup {
                    if let Some(prior) = self.find_live_by_dedup(hash).await? {
                        return Ok(prior);
                    }
                }
                Err(AxisError::Conflict(format!(
                    "conversation {} already has a live job",
                    options.conversation_id.as_deref().unwrap_or("<none>")
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_live_by_dedup(&self, hash: &str) -> Result<Option<Job>, AxisError> {
        let row = sqlx::query(
            "SELECT * FROM jobs
             WHERE dedup_hash = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_job(&self, id: &str) -> Result<Job, AxisError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_job(&row),
            None => Err(AxisError::NotFound(format!("job {id}"))),
        }
    }

    /// Pending jobs waiting for a worker.
    pub async fn queue_depth(&self) -> Result<i64, AxisError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Jobs currently moving through the pipeline.
    pub async fn active_job_count(&self) -> Result<i64, AxisError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs
             WHERE status IN ('planning', 'validating', 'awaiting_approval', 'executing')",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    // ------------------------------------------------------------------
    // Claim
    // ------------------------------------------------------------------

    /// Atomically claim the oldest pending job of the highest priority.
    /// Exactly one of N concurrent callers wins; the rest get `None`.
    pub async fn claim_job(&self, worker_id: &str) -> Result<Option<Job>, AxisError> {
        if worker_id.trim().is_empty() {
            return Err(AxisError::InvalidWorker);
        }

        let mut tx = self.pool.begin().await?;

        let job_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE status = 'pending'
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'planning', worker_id = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(worker_id)
        .bind(now_str())
        .bind(&job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Another worker claimed it between our SELECT and UPDATE.
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let job = row_to_job(&row)?;
        info!(job_id = %job.id, worker_id, "job claimed");
        self.emit(StatusChange {
            job_id: job.id.clone(),
            from: JobStatus::Pending,
            to: JobStatus::Planning,
        });
        Ok(Some(job))
    }

    // ------------------------------------------------------------------
    // Transition
    // ------------------------------------------------------------------

    /// CAS transition. Returns `Ok(false)` on a CAS miss; fails on an
    /// invalid graph edge or a cycle-counter overflow.
    pub async fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        update: TransitionUpdate,
    ) -> Result<bool, AxisError> {
        if !from.can_transition(to) {
            return Err(AxisError::InvalidTransition { from, to });
        }

        let revision = from == JobStatus::Validating && to == JobStatus::Planning;
        let replan = from == JobStatus::Executing && to == JobStatus::Planning;

        let mut sets = vec![
            "status = ?".to_string(),
            "updated_at = ?".to_string(),
        ];
        if revision {
            sets.push("revision_count = revision_count + 1".to_string());
        }
        if replan {
            sets.push("replan_count = replan_count + 1".to_string());
        }
        if to.is_terminal() {
            sets.push("completed_at = ?".to_string());
        }
        if to.holds_worker() {
            if update.worker_id.is_some() {
                sets.push("worker_id = ?".to_string());
            }
        } else {
            sets.push("worker_id = NULL".to_string());
        }
        if update.plan.is_some() {
            sets.push("plan = ?".to_string());
        }
        if update.validation.is_some() {
            sets.push("validation = ?".to_string());
        }
        if update.result.is_some() {
            sets.push("result = ?".to_string());
        }
        if update.error.is_some() {
            sets.push("error = ?".to_string());
        }
        if update.metadata.is_some() {
            sets.push("metadata = ?".to_string());
        }

        let mut sql = format!("UPDATE jobs SET {} WHERE id = ? AND status = ?", sets.join(", "));
        if revision {
            sql.push_str(&format!(" AND revision_count < {MAX_REVISIONS}"));
        }
        if replan {
            sql.push_str(&format!(" AND replan_count < {MAX_REPLANS}"));
        }

        let now = now_str();
        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(&now);
        if to.is_terminal() {
            query = query.bind(&now);
        }
        if to.holds_worker() {
            if let Some(worker_id) = &update.worker_id {
                query = query.bind(worker_id);
            }
        }
        if let Some(plan) = &update.plan {
            query = query.bind(serde_json::to_string(plan)?);
        }
        if let Some(validation) = &update.validation {
            query = query.bind(serde_json::to_string(validation)?);
        }
        if let Some(result) = &update.result {
            query = query.bind(serde_json::to_string(result)?);
        }
        if let Some(error) = &update.error {
            query = query.bind(serde_json::to_string(error)?);
        }
        if let Some(metadata) = &update.metadata {
            query = query.bind(serde_json::to_string(metadata)?);
        }
        query = query.bind(id).bind(from.as_str());

        let rows_affected = query.execute(&self.pool).await?.rows_affected();
        if rows_affected == 0 {
            // Distinguish a CAS miss from a counter overflow.
            let job = self.get_job(id).await?;
            if job.status == from {
                if revision && job.revision_count >= MAX_REVISIONS {
                    return Err(AxisError::MaxRevisions(id.to_string()));
                }
                if replan && job.replan_count >= MAX_REPLANS {
                    return Err(AxisError::MaxReplans(id.to_string()));
                }
            }
            return Ok(false);
        }

        debug!(job_id = %id, from = %from, to = %to, "transition");
        self.emit(StatusChange {
            job_id: id.to_string(),
            from,
            to,
        });
        Ok(true)
    }

    /// Cancel a non-terminal job from whatever state it is in. Returns
    /// `Ok(false)` when the job had already reached a terminal state.
    pub async fn cancel_job(&self, id: &str) -> Result<bool, AxisError> {
        loop {
            let job = self.get_job(id).await?;
            if job.status.is_terminal() {
                return Ok(false);
            }
            if self
                .transition(id, job.status, JobStatus::Cancelled, TransitionUpdate::default())
                .await?
            {
                return Ok(true);
            }
            // CAS miss: another worker moved the job; re-read and retry.
        }
    }

    // ------------------------------------------------------------------
    // Conversations & messages
    // ------------------------------------------------------------------

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation, AxisError> {
        let id = Uuid::now_v7().to_string();
        let now = now_str();
        sqlx::query(
            "INSERT INTO conversations (id, status, title, created_at, updated_at)
             VALUES (?, 'active', ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_conversation(&id).await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, AxisError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| AxisError::NotFound(format!("conversation {id}")))?;
        Ok(Conversation {
            id: row.get("id"),
            status: ConversationStatus::from_str(row.get::<String, _>("status").as_str())
                .map_err(AxisError::Internal)?,
            title: row.get("title"),
            created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
        })
    }

    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<String, AxisError> {
        let id = Uuid::now_v7().to_string();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(now_str())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// The most recent messages in chronological order.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, AxisError> {
        let rows = sqlx::query(
            "SELECT role, content FROM (
                 SELECT role, content, created_at, id FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?
             ) ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ChatMessage {
                    role: ChatRole::from_str(row.get::<String, _>("role").as_str())
                        .map_err(AxisError::Internal)?,
                    content: row.get("content"),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Execution log
    // ------------------------------------------------------------------

    pub async fn step_started(
        &self,
        job_id: &str,
        step_id: &str,
        gear: &str,
        action: &str,
    ) -> Result<i64, AxisError> {
        let result = sqlx::query(
            "INSERT INTO execution_log (job_id, step_id, gear, action, status, started_at)
             VALUES (?, ?, ?, ?, 'started', ?)",
        )
        .bind(job_id)
        .bind(step_id)
        .bind(gear)
        .bind(action)
        .bind(now_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn step_finished(
        &self,
        entry_id: i64,
        success: bool,
        error: Option<&ErrorInfo>,
    ) -> Result<(), AxisError> {
        sqlx::query(
            "UPDATE execution_log SET status = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(if success { "completed" } else { "failed" })
        .bind(error.map(serde_json::to_string).transpose()?)
        .bind(now_str())
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, AxisError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AxisError::Internal(format!("bad timestamp '{raw}': {e}")))
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
) -> Result<Option<T>, AxisError> {
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn row_to_job(row: &SqliteRow) -> Result<Job, AxisError> {
    Ok(Job {
        id: row.get("id"),
        status: JobStatus::from_str(row.get::<String, _>("status").as_str())
            .map_err(AxisError::Internal)?,
        priority: Priority::from_i64(row.get("priority")),
        source: JobSource::from_str(row.get::<String, _>("source").as_str())
            .map_err(AxisError::Internal)?,
        conversation_id: row.get("conversation_id"),
        parent_id: row.get("parent_id"),
        user_id: row.get("user_id"),
        content: row.get("content"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        timeout_ms: row.get("timeout_ms"),
        revision_count: row.get("revision_count"),
        replan_count: row.get("replan_count"),
        worker_id: row.get("worker_id"),
        plan: parse_json_column(row.get("plan"))?,
        validation: parse_json_column(row.get("validation"))?,
        result: parse_json_column(row.get("result"))?,
        error: parse_json_column(row.get("error"))?,
        dedup_hash: row.get("dedup_hash"),
        metadata: parse_json_column(row.get("metadata"))?.unwrap_or_default(),
        created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(|raw| parse_ts(&raw))
            .transpose()?,
    })
}
