//! Point-to-point message fabric.
//!
//! Each registered component is a handler. A request inserts a oneshot
//! sender into the pending table keyed by correlation id, runs the handler
//! concurrently, and wakes on reply, timeout, or cancellation. The pending
//! entry is removed on every exit path; a late reply finds no entry and is
//! discarded.

use crate::error::AxisError;
use async_trait::async_trait;
use meridian_protocol::{ComponentId, ErrorInfo, Message, MessageKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A registered component: one async handler per component id.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<Message, ErrorInfo>;
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Message, ErrorInfo>>>>>;

/// The fabric. Registration is serialized; dispatch is lock-free reads of a
/// snapshot map.
#[derive(Clone, Default)]
pub struct Router {
    handlers: Arc<Mutex<HashMap<ComponentId, Arc<dyn MessageHandler>>>>,
    pending: Pending,
}

/// Removes the pending entry on drop so every exit path releases it.
struct PendingGuard {
    pending: Pending,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.correlation_id);
        }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ComponentId, handler: Arc<dyn MessageHandler>) {
        let mut handlers = match self.handlers.lock() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(component = %id, "handler registered");
        handlers.insert(id, handler);
    }

    fn handler_for(&self, id: &ComponentId) -> Option<Arc<dyn MessageHandler>> {
        let handlers = match self.handlers.lock() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(id).cloned()
    }

    /// Number of requests currently awaiting a reply.
    pub fn outstanding(&self) -> usize {
        match self.pending.lock() {
            Ok(pending) => pending.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Send a request and await its reply. On timeout or cancellation the
    /// pending pairing is destroyed and any late reply is dropped.
    pub async fn request(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, AxisError> {
        let to = message.to.clone();
        let handler = self
            .handler_for(&to)
            .ok_or_else(|| AxisError::Unreachable(to.clone()))?;

        let correlation_id = message.correlation_id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = match self.pending.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.insert(correlation_id.clone(), tx);
        }
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            correlation_id: correlation_id.clone(),
        };

        // Run the handler concurrently; it delivers through the pending table
        // so a timed-out request never receives a stale wake-up.
        let deliver_pending = Arc::clone(&self.pending);
        let deliver_correlation = correlation_id.clone();
        tokio::spawn(async move {
            let outcome = handler.handle(message).await;
            let sender = {
                let mut pending = match deliver_pending.lock() {
                    Ok(pending) => pending,
                    Err(poisoned) => poisoned.into_inner(),
                };
                pending.remove(&deliver_correlation)
            };
            match sender {
                Some(sender) => {
                    // The receiver may have just dropped; nothing to do then.
                    let _ = sender.send(outcome);
                }
                None => {
                    debug!(correlation_id = %deliver_correlation, "late reply discarded");
                }
            }
        });

        tokio::select! {
            outcome = rx => match outcome {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(info)) => Err(AxisError::Handler(info)),
                Err(_) => Err(AxisError::Internal("reply channel closed".to_string())),
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(component = %to, correlation_id = %correlation_id, "request timed out");
                Err(AxisError::Timeout {
                    component: to,
                    ms: timeout.as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => Err(AxisError::Cancelled),
        }
    }

    /// Convenience wrapper building the request envelope from Axis.
    pub async fn request_to(
        &self,
        to: ComponentId,
        kind: MessageKind,
        payload: serde_json::Value,
        job_id: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, AxisError> {
        let mut message = Message::request(ComponentId::Axis, to, kind, payload);
        if let Some(job_id) = job_id {
            message = message.with_job(job_id);
        }
        self.request(message, timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, message: Message) -> Result<Message, ErrorInfo> {
            Ok(message.reply(MessageKind::PlanResponse, message.payload.clone()))
        }
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, message: Message) -> Result<Message, ErrorInfo> {
            tokio::time::sleep(self.0).await;
            Ok(message.reply(MessageKind::PlanResponse, json!("late")))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: Message) -> Result<Message, ErrorInfo> {
            Err(ErrorInfo::new(
                meridian_protocol::ErrorCode::ScoutUnreachable,
                "model offline",
            ))
        }
    }

    fn request_msg() -> Message {
        Message::request(
            ComponentId::Axis,
            ComponentId::Scout,
            MessageKind::PlanRequest,
            json!({"q": 1}),
        )
    }

    #[tokio::test]
    async fn round_trip_pairs_by_correlation() {
        let router = Router::new();
        router.register(ComponentId::Scout, Arc::new(EchoHandler));

        let request = request_msg();
        let correlation = request.correlation_id.clone();
        let reply = router
            .request(request, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.correlation_id, correlation);
        assert_eq!(reply.payload, json!({"q": 1}));
        assert_eq!(router.outstanding(), 0);
    }

    #[tokio::test]
    async fn unregistered_component_is_unreachable() {
        let router = Router::new();
        let err = router
            .request(request_msg(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AxisError::Unreachable(ComponentId::Scout)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_pending_and_discards_late_reply() {
        let router = Router::new();
        router.register(
            ComponentId::Scout,
            Arc::new(SlowHandler(Duration::from_secs(60))),
        );

        let err = router
            .request(request_msg(), Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AxisError::Timeout { .. }));
        assert_eq!(router.outstanding(), 0);

        // Let the slow handler finish; its reply must be dropped silently.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(router.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_the_pairing() {
        let router = Router::new();
        router.register(
            ComponentId::Scout,
            Arc::new(SlowHandler(Duration::from_secs(60))),
        );

        let cancel = CancellationToken::new();
        let requester = {
            let router = router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                router
                    .request(request_msg(), Duration::from_secs(600), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
        let err = requester.await.unwrap().unwrap_err();
        assert!(matches!(err, AxisError::Cancelled));
        assert_eq!(router.outstanding(), 0);
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_payload() {
        let router = Router::new();
        router.register(ComponentId::Scout, Arc::new(FailingHandler));
        let err = router
            .request(request_msg(), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AxisError::Handler(info) => {
                assert_eq!(info.code, meridian_protocol::ErrorCode::ScoutUnreachable);
                assert!(info.retriable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handlers_run_concurrently() {
        let router = Router::new();
        router.register(
            ComponentId::Scout,
            Arc::new(SlowHandler(Duration::from_millis(50))),
        );

        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router
                    .request(request_msg(), Duration::from_secs(5), &CancellationToken::new())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Four serial round-trips would be 200ms+.
        assert!(started.elapsed() < Duration::from_millis(190));
    }
}
