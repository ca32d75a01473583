//! Bounded-concurrency pullers of pending jobs.
//!
//! Each worker loops claim -> drive -> repeat with bounded exponential
//! backoff while the queue is empty. A separate watcher subscribes to
//! status changes and redrives jobs an external acceptor approved
//! (`awaiting_approval -> executing`).

use crate::pipeline::PipelineProcessor;
use crate::queue::JobQueue;
use crate::serializer::ConversationSerializer;
use meridian_protocol::defaults::{
    CLAIM_BACKOFF_BASE_MS, CLAIM_BACKOFF_JITTER_MS, CLAIM_BACKOFF_MAX_MS,
};
use meridian_protocol::JobStatus;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct WorkerPool {
    queue: JobQueue,
    pipeline: Arc<PipelineProcessor>,
    serializer: ConversationSerializer,
    workers: usize,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, pipeline: Arc<PipelineProcessor>, workers: usize) -> Self {
        Self {
            queue,
            pipeline,
            serializer: ConversationSerializer::new(),
            workers: workers.max(1),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the worker fibers and the approval watcher.
    pub fn start(&mut self) {
        for index in 0..self.workers {
            let worker_id = format!("worker-{index}");
            let queue = self.queue.clone();
            let pipeline = Arc::clone(&self.pipeline);
            let serializer = self.serializer.clone();
            let cancel = self.cancel.clone();
            self.handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, pipeline, serializer, cancel).await;
            }));
        }

        let queue = self.queue.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            approval_watcher(queue, pipeline, cancel).await;
        }));

        info!(workers = self.workers, "worker pool started");
    }

    /// Signal shutdown and wait for every fiber to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: String,
    queue: JobQueue,
    pipeline: Arc<PipelineProcessor>,
    serializer: ConversationSerializer,
    cancel: CancellationToken,
) {
    let mut backoff = CLAIM_BACKOFF_BASE_MS;
    let mut tick: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let claimed = match queue.claim_job(&worker_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(worker_id, error = %e, "claim failed");
                None
            }
        };

        match claimed {
            Some(job) => {
                backoff = CLAIM_BACKOFF_BASE_MS;
                // Serialize per conversation; solo jobs key on their own id.
                let key = job
                    .conversation_id
                    .clone()
                    .unwrap_or_else(|| job.id.clone());
                let _guard = serializer.acquire(&key).await;
                if let Err(e) = pipeline.drive(job, &cancel).await {
                    warn!(worker_id, error = %e, "pipeline run ended with error");
                }
            }
            None => {
                tick = tick.wrapping_add(1);
                let jitter = jitter_ms(&worker_id, tick);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff + jitter)) => {}
                    _ = cancel.cancelled() => return,
                }
                backoff = (backoff * 2).min(CLAIM_BACKOFF_MAX_MS);
            }
        }
    }
}

/// Deterministic jitter so idle workers do not thundering-herd the queue.
fn jitter_ms(worker_id: &str, tick: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    worker_id.hash(&mut hasher);
    tick.hash(&mut hasher);
    hasher.finish() % CLAIM_BACKOFF_JITTER_MS
}

/// Redrives execution after an external `awaiting_approval -> executing`
/// transition.
async fn approval_watcher(
    queue: JobQueue,
    pipeline: Arc<PipelineProcessor>,
    cancel: CancellationToken,
) {
    let mut events = queue.subscribe();
    loop {
        let change = tokio::select! {
            change = events.recv() => change,
            _ = cancel.cancelled() => return,
        };
        match change {
            Ok(change)
                if change.from == JobStatus::AwaitingApproval
                    && change.to == JobStatus::Executing =>
            {
                let pipeline = Arc::clone(&pipeline);
                let cancel = cancel.clone();
                let job_id = change.job_id;
                tokio::spawn(async move {
                    if let Err(e) = pipeline.resume_approved(&job_id, &cancel).await {
                        warn!(job_id, error = %e, "post-approval run ended with error");
                    }
                });
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "approval watcher lagged behind status events");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_bounded_and_deterministic() {
        for tick in 0..100 {
            let j = jitter_ms("worker-0", tick);
            assert!(j < CLAIM_BACKOFF_JITTER_MS);
            assert_eq!(j, jitter_ms("worker-0", tick));
        }
    }
}
