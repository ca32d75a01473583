//! Append-only audit log with a tamper-evident hash chain.
//!
//! Every consequential action is written here before the state change it
//! records is committed. Entries are partitioned by calendar month (UTC);
//! within a partition they form a linear SHA-256 chain. Partitions are
//! independent chains; there is no cross-month meta-chain.
//!
//! The public surface has no UPDATE or DELETE - append-only is enforced at
//! the API layer, and `verify_chain` detects any external mutation.

mod canonical;
mod log;

pub use canonical::{canonical_json, entry_hash};
pub use log::{
    AuditError, AuditExport, AuditFilter, AuditLog, BrokenLink, ChainVerification, WriteAudit,
};
