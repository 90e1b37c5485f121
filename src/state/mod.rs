//! Durable state: snapshots and the stores that keep them.

pub mod snapshot;
pub mod store;

pub use snapshot::{Snapshot, SnapshotSummary, SNAPSHOT_VERSION};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotEnvelope, SnapshotStore};
