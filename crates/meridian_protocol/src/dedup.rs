//! Dedup and memoization keys.
//!
//! The dedup hash input is exactly `(user_id, content, floor(now / window))`;
//! priority and source are deliberately excluded, so reposting the same
//! content at a different priority inside the window collides. The plan
//! signature keys approval memoization: two plans with the same step shapes
//! collide regardless of their generated ids.

use crate::types::ExecutionPlan;
use blake3::Hasher;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Stable dedup key for a user message within a time window.
pub fn dedup_hash(user_id: &str, content: &str, now_ms: i64, window_ms: i64) -> String {
    let bucket = if window_ms > 0 { now_ms / window_ms } else { now_ms };
    hash_parts(&[user_id, content, &bucket.to_string()])
}

/// Stable key for a plan's shape: step gear, action, parameters (in key
/// order), and declared risk. Plan and step ids are excluded so a re-planned
/// identical shape hits the same approval memo.
pub fn plan_signature(plan: &ExecutionPlan) -> String {
    let mut hasher = Hasher::new();
    for step in &plan.steps {
        hasher.update(step.gear.as_bytes());
        hasher.update(&[SEP]);
        hasher.update(step.action.as_bytes());
        hasher.update(&[SEP]);
        let mut keys: Vec<&String> = step.parameters.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(&[SEP]);
            hasher.update(step.parameters[key].to_string().as_bytes());
            hasher.update(&[SEP]);
        }
        hasher.update(step.risk_level.as_str().as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}
