//! Sentinel: the deterministic policy engine and its decision memory.
//!
//! `evaluate` classifies every plan step, floors its risk independently of
//! what the planner declared, applies default and user policies, scans for
//! composite-risk patterns, and aggregates the strictest verdict. It sees
//! the plan and the policy configuration only - never user messages,
//! history, or conversation identifiers.

mod approval_cache;
mod decisions;
pub mod policy;

pub use approval_cache::ApprovalCache;
pub use decisions::{DecisionMemory, DecisionMemoryError};
pub use policy::{decision_scope, evaluate};
