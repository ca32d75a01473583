//! Canonical types shared across the Meridian core.
//!
//! Everything that crosses a component boundary lives here: the job state
//! machine vocabulary, execution plans, validation results, audit entries,
//! the in-process message envelope, error codes, configuration, and the
//! data-directory layout. Crates higher in the stack (store, audit, sentinel,
//! gear, axis) depend on this one and never on each other's internals.

pub mod config;
pub mod dedup;
pub mod defaults;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::{MeridianConfig, PolicyConfig};
pub use dedup::{dedup_hash, plan_signature};
pub use error::{ErrorCode, ErrorInfo, ProtocolError};
pub use message::{ComponentId, Message, MessageKind};
pub use paths::DataDir;
pub use types::{
    ActionType, AuditActor, AuditEntry, ChatMessage, ChatRole, Conversation, ConversationStatus,
    CreateJob, Decision, DecisionVerdict, Divergence, ExecutionPlan, ExecutionStep, GearCapability,
    Job, JobResult, JobSource, JobStatus, MemoryKind, Priority, RiskLevel, StagedMemory,
    StepOutcome, StepVerdict, ValidationResult, Verdict,
};
