//! Canonical default values shared across the core.

/// Worker count in the pool.
pub const DEFAULT_WORKERS: usize = 4;

/// Dedup hash window in milliseconds.
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 5_000;

/// Router round-trip timeout for validation requests.
pub const VALIDATE_TIMEOUT_MS: u64 = 30_000;

/// Router round-trip timeout for execution requests.
pub const EXECUTE_TIMEOUT_MS: u64 = 300_000;

/// Revision cap: `validating -> planning` may happen at most this many times.
pub const MAX_REVISIONS: i64 = 3;

/// Replan cap: `executing -> planning` may happen at most this many times.
pub const MAX_REPLANS: i64 = 2;

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
pub const DEFAULT_JOB_TIMEOUT_MS: i64 = 600_000;

/// Claim-loop backoff when the queue is empty or blocked.
pub const CLAIM_BACKOFF_BASE_MS: u64 = 50;
pub const CLAIM_BACKOFF_MAX_MS: u64 = 1_000;
pub const CLAIM_BACKOFF_JITTER_MS: u64 = 50;

/// Shell gear timeout clamp.
pub const SHELL_TIMEOUT_MIN_MS: u64 = 1_000;
pub const SHELL_TIMEOUT_MAX_MS: u64 = 300_000;

/// Shell gear captured-output cap before spilling to a workspace file.
pub const SHELL_OUTPUT_CAP_BYTES: usize = 5 * 1024 * 1024;

/// Inline gear output cap before spilling to a workspace file.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Fetch capability body cap.
pub const DEFAULT_MAX_FETCH_BYTES: usize = 10 * 1024 * 1024;

/// Decision memory cap (oldest evicted beyond this).
pub const DEFAULT_DECISION_MEMORY_CAP: i64 = 512;

pub const DEFAULT_APPROVAL_CACHE_TTL_MS: u64 = 300_000;
pub const DEFAULT_APPROVAL_CACHE_MAX_ENTRIES: usize = 256;

pub const DEFAULT_SESSION_DURATION_HOURS: u64 = 24;
pub const DEFAULT_MAX_TRANSACTION_AMOUNT_USD: f64 = 100.0;

/// The only chain algorithm recognized in v1.
pub const AUDIT_CHAIN_ALGORITHM: &str = "sha-256";

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
