//! Snapshot metadata ledger
//!
//! One SQLite row per cache key recording where a cached response came
//! from, its TTL window, tags and access statistics. The ledger is
//! independent of payload storage: a row may outlive its payload in every
//! tier, and that is not an error.

pub mod db;
pub mod error;
pub mod model;
pub mod retry;
pub mod schema;
pub mod store;

pub use db::SnapshotDb;
pub use error::SnapshotError;
pub use model::{
    default_limit, RecordInput, SnapshotFilter, SnapshotMetadata, SnapshotStats, SnapshotUpdate,
};
pub use retry::{with_retry, ResourceClass, RetryPolicy};
pub use store::{SnapshotPage, SnapshotStore};
