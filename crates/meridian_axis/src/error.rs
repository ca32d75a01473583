//! Orchestrator error taxonomy.

use meridian_audit::AuditError;
use meridian_db::StoreError;
use meridian_protocol::{ComponentId, ErrorCode, ErrorInfo, JobStatus};
use meridian_sentinel::DecisionMemoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AxisError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job {0} exceeded the revision cap")]
    MaxRevisions(String),

    #[error("job {0} exceeded the replan cap")]
    MaxReplans(String),

    #[error("worker id must not be empty")]
    InvalidWorker,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("plan rejected: {0}")]
    PlanRejected(String),

    #[error("request to {component} timed out after {ms}ms")]
    Timeout { component: ComponentId, ms: u64 },

    #[error("component {0} is not registered")]
    Unreachable(ComponentId),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Handler(ErrorInfo),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Decision(#[from] DecisionMemoryError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AxisError {
    /// The serializable shape persisted on `jobs.error`.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            AxisError::InvalidTransition { .. } | AxisError::InvalidWorker => {
                ErrorInfo::new(ErrorCode::Validation, self.to_string())
            }
            AxisError::MaxRevisions(_) => ErrorInfo::new(ErrorCode::MaxRevisions, self.to_string()),
            AxisError::MaxReplans(_) => ErrorInfo::new(ErrorCode::MaxReplans, self.to_string()),
            AxisError::NotFound(_) => ErrorInfo::new(ErrorCode::NotFound, self.to_string()),
            AxisError::Conflict(_) => ErrorInfo::new(ErrorCode::Conflict, self.to_string()),
            AxisError::PlanRejected(_) => {
                ErrorInfo::new(ErrorCode::PlanRejected, self.to_string())
            }
            AxisError::Timeout { .. } => ErrorInfo::new(ErrorCode::Timeout, self.to_string()),
            AxisError::Unreachable(component) => match component {
                ComponentId::Scout => {
                    ErrorInfo::new(ErrorCode::ScoutUnreachable, self.to_string())
                }
                _ => ErrorInfo::new(ErrorCode::Internal, self.to_string()),
            },
            AxisError::Cancelled => ErrorInfo::new(ErrorCode::Validation, self.to_string()),
            AxisError::Handler(info) => info.clone(),
            _ => ErrorInfo::internal(self.to_string()),
        }
    }
}
