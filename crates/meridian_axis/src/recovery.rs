//! Crash recovery, run once at startup.
//!
//! Jobs stranded in a worker-held state are reset to pending; execution-log
//! rows still marked started are failed. Jobs awaiting approval are left
//! alone - they are waiting on the user, not on a worker.

use crate::error::AxisError;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoverySummary {
    pub non_terminal_job_count: usize,
    pub reset_job_ids: Vec<String>,
    pub stale_pipeline_job_ids: Vec<String>,
    pub failed_execution_entries: u64,
}

/// Idempotent: running it twice is the same as running it once.
pub async fn recover_jobs(pool: &SqlitePool) -> Result<RecoverySummary, AxisError> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut summary = RecoverySummary::default();

    let rows = sqlx::query(
        "SELECT id, status FROM jobs
         WHERE status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .fetch_all(pool)
    .await?;
    summary.non_terminal_job_count = rows.len();

    for row in rows {
        let id: String = row.get("id");
        let status: String = row.get("status");

        if status == "executing" {
            let failed = sqlx::query(
                "UPDATE execution_log SET status = 'failed', completed_at = ?
                 WHERE job_id = ? AND status = 'started'",
            )
            .bind(&now)
            .bind(&id)
            .execute(pool)
            .await?
            .rows_affected();
            summary.failed_execution_entries += failed;
        }

        if matches!(status.as_str(), "planning" | "validating" | "executing") {
            summary.stale_pipeline_job_ids.push(id.clone());
            let reset = sqlx::query(
                "UPDATE jobs SET status = 'pending', worker_id = NULL, updated_at = ?
                 WHERE id = ? AND status = ?",
            )
            .bind(&now)
            .bind(&id)
            .bind(&status)
            .execute(pool)
            .await?
            .rows_affected();
            if reset > 0 {
                summary.reset_job_ids.push(id);
            }
        }
    }

    info!(
        non_terminal = summary.non_terminal_job_count,
        reset = summary.reset_job_ids.len(),
        failed_entries = summary.failed_execution_entries,
        "recovery pass complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use meridian_db::Store;
    use meridian_protocol::{CreateJob, DataDir, JobStatus};

    async fn setup() -> (tempfile::TempDir, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(DataDir::new(dir.path()));
        let queue = JobQueue::open(&store, 5_000).await.unwrap();
        (dir, queue)
    }

    async fn seed_in_state(queue: &JobQueue, content: &str, target: JobStatus) -> String {
        let job = queue
            .create_job(CreateJob::user_message(content).with_user("u1"))
            .await
            .unwrap();
        if target == JobStatus::Pending {
            return job.id;
        }
        queue.claim_job("w-dead").await.unwrap().unwrap();
        let path: &[JobStatus] = match target {
            JobStatus::Planning => &[],
            JobStatus::Validating => &[JobStatus::Validating],
            JobStatus::Executing => &[JobStatus::Validating, JobStatus::Executing],
            JobStatus::AwaitingApproval => {
                &[JobStatus::Validating, JobStatus::AwaitingApproval]
            }
            _ => &[],
        };
        let mut from = JobStatus::Planning;
        for to in path {
            queue
                .transition(&job.id, from, *to, Default::default())
                .await
                .unwrap();
            from = *to;
        }
        job.id
    }

    #[tokio::test]
    async fn resets_worker_held_states_and_fails_stale_steps() {
        let (_dir, queue) = setup().await;
        let executing = seed_in_state(&queue, "executing job", JobStatus::Executing).await;
        let entry = queue
            .step_started(&executing, "s1", "file-manager", "read")
            .await
            .unwrap();

        let summary = recover_jobs(queue.pool()).await.unwrap();
        assert_eq!(summary.failed_execution_entries, 1);
        assert_eq!(summary.reset_job_ids, vec![executing.clone()]);

        let job = queue.get_job(&executing).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());

        let (status, completed_at): (String, Option<String>) =
            sqlx::query_as("SELECT status, completed_at FROM execution_log WHERE id = ?")
                .bind(entry)
                .fetch_one(queue.pool())
                .await
                .unwrap();
        assert_eq!(status, "failed");
        assert!(completed_at.is_some());
    }

    #[tokio::test]
    async fn awaiting_approval_is_left_untouched() {
        let (_dir, queue) = setup().await;
        let waiting = seed_in_state(&queue, "approval job", JobStatus::AwaitingApproval).await;

        let summary = recover_jobs(queue.pool()).await.unwrap();
        assert_eq!(summary.non_terminal_job_count, 1);
        assert!(summary.reset_job_ids.is_empty());
        assert_eq!(
            queue.get_job(&waiting).await.unwrap().status,
            JobStatus::AwaitingApproval
        );
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let (_dir, queue) = setup().await;
        seed_in_state(&queue, "planning job", JobStatus::Planning).await;
        seed_in_state(&queue, "validating job", JobStatus::Validating).await;

        let first = recover_jobs(queue.pool()).await.unwrap();
        assert_eq!(first.reset_job_ids.len(), 2);

        let second = recover_jobs(queue.pool()).await.unwrap();
        assert!(second.reset_job_ids.is_empty());
        assert_eq!(second.failed_execution_entries, 0);
        // Both jobs are pending either way.
        assert_eq!(second.non_terminal_job_count, 2);
    }
}
