//! The planner seam.
//!
//! Scout is an external, model-backed collaborator. The core sees only this
//! trait and the `plan.request`/`plan.response` contract; provider adapters
//! implement `Planner` and are registered on the router at startup.

use crate::router::MessageHandler;
use async_trait::async_trait;
use meridian_protocol::{
    ChatMessage, ErrorInfo, ExecutionPlan, GearCapability, Message, MessageKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What the pipeline sends to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<GearCapability>,
}

/// What comes back: a direct answer or a plan to validate and execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanOutcome {
    Text { text: String },
    Plan { plan: ExecutionPlan },
}

/// A planning backend. Streaming providers aggregate into one outcome.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<PlanOutcome, ErrorInfo>;
}

/// Router adapter: unwraps `plan.request`, runs the planner, wraps
/// `plan.response`.
pub struct ScoutHandler {
    planner: Arc<dyn Planner>,
}

impl ScoutHandler {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl MessageHandler for ScoutHandler {
    async fn handle(&self, message: Message) -> Result<Message, ErrorInfo> {
        let request: PlanRequest = serde_json::from_value(message.payload.clone())
            .map_err(|e| ErrorInfo::new(meridian_protocol::ErrorCode::Validation, e.to_string()))?;
        let outcome = self.planner.plan(request).await?;
        let payload = serde_json::to_value(&outcome)
            .map_err(|e| ErrorInfo::internal(e.to_string()))?;
        Ok(message.reply(MessageKind::PlanResponse, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_protocol::{ChatRole, ComponentId};
    use serde_json::json;

    struct TextPlanner;

    #[async_trait]
    impl Planner for TextPlanner {
        async fn plan(&self, request: PlanRequest) -> Result<PlanOutcome, ErrorInfo> {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(PlanOutcome::Text {
                text: format!("echo: {last}"),
            })
        }
    }

    #[tokio::test]
    async fn handler_round_trips_the_contract() {
        let handler = ScoutHandler::new(Arc::new(TextPlanner));
        let request = Message::request(
            ComponentId::Axis,
            ComponentId::Scout,
            MessageKind::PlanRequest,
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [],
            }),
        );
        let reply = handler.handle(request).await.unwrap();
        assert_eq!(reply.kind, MessageKind::PlanResponse);
        let outcome: PlanOutcome = serde_json::from_value(reply.payload).unwrap();
        match outcome {
            PlanOutcome::Text { text } => assert_eq!(text, "echo: hi"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_payload_is_a_validation_error() {
        let handler = ScoutHandler::new(Arc::new(TextPlanner));
        let request = Message::request(
            ComponentId::Axis,
            ComponentId::Scout,
            MessageKind::PlanRequest,
            json!({"nope": true}),
        );
        let err = handler.handle(request).await.unwrap_err();
        assert_eq!(err.code, meridian_protocol::ErrorCode::Validation);
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let outcome = PlanOutcome::Text { text: "x".into() };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "text");
    }

    #[test]
    fn plan_outcome_roundtrip() {
        let plan = ExecutionPlan::new("job-1", vec![]);
        let outcome = PlanOutcome::Plan { plan: plan.clone() };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "plan");
        let parsed: PlanOutcome = serde_json::from_value(json).unwrap();
        match parsed {
            PlanOutcome::Plan { plan: p } => assert_eq!(p, plan),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    // ChatRole is part of the wire contract; pin its casing.
    #[test]
    fn chat_role_serializes_lowercase() {
        let msg = ChatMessage {
            role: ChatRole::Assistant,
            content: "ok".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
