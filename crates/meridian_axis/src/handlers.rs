//! Router adapters for the sentinel and the gear runtime.

use crate::router::MessageHandler;
use async_trait::async_trait;
use meridian_gear::{ExecuteRequest, GearRuntime};
use meridian_protocol::{ErrorInfo, ExecutionPlan, Message, MessageKind, PolicyConfig};
use serde::Deserialize;
use std::sync::Arc;

/// Handles `validate.request`. The payload carries the plan and nothing
/// else - the information barrier starts at this seam.
pub struct SentinelHandler {
    config: PolicyConfig,
}

impl SentinelHandler {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }
}

#[derive(Deserialize)]
struct ValidatePayload {
    plan: ExecutionPlan,
}

#[async_trait]
impl MessageHandler for SentinelHandler {
    async fn handle(&self, message: Message) -> Result<Message, ErrorInfo> {
        let payload: ValidatePayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| ErrorInfo::new(meridian_protocol::ErrorCode::Validation, e.to_string()))?;
        let result = meridian_sentinel::evaluate(&payload.plan, &self.config);
        let payload = serde_json::to_value(&result)
            .map_err(|e| ErrorInfo::internal(e.to_string()))?;
        Ok(message.reply(MessageKind::ValidateResponse, payload))
    }
}

/// Handles `execute.request` by dispatching to the hosted gear.
pub struct GearRuntimeHandler {
    runtime: Arc<GearRuntime>,
}

impl GearRuntimeHandler {
    pub fn new(runtime: Arc<GearRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl MessageHandler for GearRuntimeHandler {
    async fn handle(&self, message: Message) -> Result<Message, ErrorInfo> {
        let mut request: ExecuteRequest = serde_json::from_value(message.payload.clone())
            .map_err(|e| ErrorInfo::new(meridian_protocol::ErrorCode::Validation, e.to_string()))?;
        request.correlation_id = Some(message.correlation_id.clone());
        if request.job_id.is_none() {
            request.job_id = message.job_id.clone();
        }
        let response = self.runtime.execute(request).await;
        let payload = serde_json::to_value(&response)
            .map_err(|e| ErrorInfo::internal(e.to_string()))?;
        Ok(message.reply(MessageKind::ExecuteResponse, payload))
    }
}
