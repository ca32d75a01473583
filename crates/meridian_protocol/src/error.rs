//! Error codes and payloads that cross component boundaries.
//!
//! `ErrorCode` is the closed taxonomy from the error-handling design;
//! `ErrorInfo` is the JSON shape stored on `jobs.error` and returned by
//! gears. Library crates wrap these in their own thiserror enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The closed set of surfaced error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad input: malformed plan, schema mismatch.
    Validation,
    /// The policy engine rejected the plan outright.
    PlanRejected,
    /// A claim or transition was attempted with an empty worker id.
    InvalidWorker,
    /// Job, secret, or partition does not exist.
    NotFound,
    /// CAS miss or dedup collision; the caller may retry or reuse.
    Conflict,
    /// The revision counter would exceed its cap.
    MaxRevisions,
    /// The replan counter would exceed its cap.
    MaxReplans,
    /// The planner could not be reached.
    ScoutUnreachable,
    /// A router round-trip or gear execution timed out.
    Timeout,
    /// A gear asked for the plan to be rebuilt.
    NeedsReplan,
    /// Sandbox violation: blocked host, path escape, disabled capability.
    PermissionDenied,
    /// Sandbox violation: output or body over the configured cap.
    SizeLimitExceeded,
    /// Bug or broken invariant.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::PlanRejected => "PLAN_REJECTED",
            ErrorCode::InvalidWorker => "INVALID_WORKER",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::MaxRevisions => "MAX_REVISIONS",
            ErrorCode::MaxReplans => "MAX_REPLANS",
            ErrorCode::ScoutUnreachable => "SCOUT_UNREACHABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NeedsReplan => "NEEDS_REPLAN",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::SizeLimitExceeded => "SIZE_LIMIT_EXCEEDED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether a retry can reasonably change the outcome.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Conflict
                | ErrorCode::ScoutUnreachable
                | ErrorCode::Timeout
                | ErrorCode::NeedsReplan
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serializable error payload: the shape stored on job rows and returned in
/// gear responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub retriable: bool,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retriable: code.retriable(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors raised by the protocol crate itself (parsing, config).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid component id: '{0}'")]
    InvalidComponentId(String),
    #[error("invalid message kind: '{0}'")]
    InvalidMessageKind(String),
    #[error("unsupported audit chain algorithm: '{0}' (v1 is fixed at sha-256)")]
    UnsupportedChainAlgorithm(String),
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
