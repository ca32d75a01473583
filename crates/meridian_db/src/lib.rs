//! The Store: transactional key-partitioned persistence.
//!
//! One physical SQLite file per partition (primary, journal, sentinel, and
//! one audit partition per calendar month). Partitions are opened lazily and
//! cached; components obtain a pool for their partition and own their SQL
//! from there. Audit partitions are opened with `synchronous=FULL` so a
//! crash never drops a committed entry.

mod error;
mod store;

pub use error::StoreError;
pub use store::{Partition, Store};
