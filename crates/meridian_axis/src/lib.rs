//! Axis: the orchestration core.
//!
//! Owns the job state machine (JobQueue), the point-to-point message fabric
//! (Router), per-conversation serialization, the worker pool, the pipeline
//! that drives one job from planning through execution, crash recovery, and
//! the journal staging hooks.

mod error;
mod handlers;
mod journal;
mod pipeline;
mod queue;
mod recovery;
mod router;
mod scout;
mod serializer;
mod worker_pool;

pub use error::AxisError;
pub use handlers::{GearRuntimeHandler, SentinelHandler};
pub use journal::JournalStore;
pub use pipeline::{PipelineProcessor, QueueSpawner};
pub use queue::{JobQueue, StatusChange, TransitionUpdate};
pub use recovery::{recover_jobs, RecoverySummary};
pub use router::{MessageHandler, Router};
pub use scout::{PlanOutcome, PlanRequest, Planner, ScoutHandler};
pub use serializer::ConversationSerializer;
pub use worker_pool::WorkerPool;
