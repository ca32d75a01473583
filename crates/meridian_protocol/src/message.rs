//! The point-to-point message envelope and component identifiers.
//!
//! The Router is an in-process fabric: messages are serde structs, not wire
//! frames. Correlation ids pair a request with its reply; a reply carries the
//! request's id in `reply_to`.

use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The closed set of addressable components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ComponentId {
    /// The orchestrator (queue + workers + pipeline).
    Axis,
    /// The planner.
    Scout,
    /// The policy engine.
    Sentinel,
    /// A specific gear, addressed as `gear:<name>`.
    Gear(String),
    /// The gear hosting runtime, which dispatches to individual gears.
    GearRuntime,
}

impl ComponentId {
    pub fn gear(name: impl Into<String>) -> Self {
        ComponentId::Gear(name.into())
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::Axis => write!(f, "axis"),
            ComponentId::Scout => write!(f, "scout"),
            ComponentId::Sentinel => write!(f, "sentinel"),
            ComponentId::Gear(name) => write!(f, "gear:{name}"),
            ComponentId::GearRuntime => write!(f, "gear:runtime"),
        }
    }
}

impl FromStr for ComponentId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "axis" => Ok(ComponentId::Axis),
            "scout" => Ok(ComponentId::Scout),
            "sentinel" => Ok(ComponentId::Sentinel),
            "gear:runtime" => Ok(ComponentId::GearRuntime),
            other => match other.strip_prefix("gear:") {
                Some(name) if !name.is_empty() => Ok(ComponentId::Gear(name.to_string())),
                _ => Err(ProtocolError::InvalidComponentId(other.to_string())),
            },
        }
    }
}

impl From<ComponentId> for String {
    fn from(id: ComponentId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ComponentId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Message kind, the dotted `type` field of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageKind {
    PlanRequest,
    PlanResponse,
    ValidateRequest,
    ValidateResponse,
    ExecuteRequest,
    ExecuteResponse,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PlanRequest => "plan.request",
            MessageKind::PlanResponse => "plan.response",
            MessageKind::ValidateRequest => "validate.request",
            MessageKind::ValidateResponse => "validate.response",
            MessageKind::ExecuteRequest => "execute.request",
            MessageKind::ExecuteResponse => "execute.response",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan.request" => Ok(MessageKind::PlanRequest),
            "plan.response" => Ok(MessageKind::PlanResponse),
            "validate.request" => Ok(MessageKind::ValidateRequest),
            "validate.response" => Ok(MessageKind::ValidateResponse),
            "execute.request" => Ok(MessageKind::ExecuteRequest),
            "execute.response" => Ok(MessageKind::ExecuteResponse),
            "error" => Ok(MessageKind::Error),
            other => Err(ProtocolError::InvalidMessageKind(other.to_string())),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, ProtocolError> {
        value.parse()
    }
}

/// The envelope for every message on the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub from: ComponentId,
    pub to: ComponentId,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub payload: Value,
}

impl Message {
    /// Build a new request with a fresh id and correlation id.
    pub fn request(from: ComponentId, to: ComponentId, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            from,
            to,
            kind,
            reply_to: None,
            job_id: None,
            payload,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Build the reply to this message: same correlation id, reversed route.
    pub fn reply(&self, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            correlation_id: self.correlation_id.clone(),
            timestamp: Utc::now(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind,
            reply_to: Some(self.id.clone()),
            job_id: self.job_id.clone(),
            payload,
        }
    }

    /// Build an error reply carrying an `ErrorInfo` payload.
    pub fn error_reply(&self, error: &crate::error::ErrorInfo) -> Self {
        self.reply(
            MessageKind::Error,
            serde_json::to_value(error).unwrap_or(Value::Null),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_id_roundtrip() {
        for raw in ["axis", "scout", "sentinel", "gear:runtime", "gear:file-manager"] {
            let id: ComponentId = raw.parse().unwrap();
            assert_eq!(id.to_string(), raw);
        }
        assert!("gear:".parse::<ComponentId>().is_err());
        assert!("router".parse::<ComponentId>().is_err());
    }

    #[test]
    fn gear_runtime_is_not_a_named_gear() {
        let id: ComponentId = "gear:runtime".parse().unwrap();
        assert_eq!(id, ComponentId::GearRuntime);
    }

    #[test]
    fn reply_preserves_correlation_and_reverses_route() {
        let req = Message::request(
            ComponentId::Axis,
            ComponentId::Scout,
            MessageKind::PlanRequest,
            serde_json::json!({"messages": []}),
        )
        .with_job("job-1");
        let reply = req.reply(MessageKind::PlanResponse, serde_json::json!({"kind": "text"}));

        assert_eq!(reply.correlation_id, req.correlation_id);
        assert_eq!(reply.reply_to.as_deref(), Some(req.id.as_str()));
        assert_eq!(reply.from, ComponentId::Scout);
        assert_eq!(reply.to, ComponentId::Axis);
        assert_eq!(reply.job_id.as_deref(), Some("job-1"));
    }

    #[test]
    fn envelope_serializes_kind_as_dotted_string() {
        let msg = Message::request(
            ComponentId::Axis,
            ComponentId::Sentinel,
            MessageKind::ValidateRequest,
            Value::Null,
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "validate.request");
        assert_eq!(json["to"], "sentinel");
    }
}
