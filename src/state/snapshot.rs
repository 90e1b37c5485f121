//! Snapshot: the durable projection of an orchestrator instance.

use serde::{Deserialize, Serialize};

use crate::instance::checkpoint::{Checkpoint, InstanceId};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable projection of an instance's state.
///
/// Holds configuration, pending tasks, plans, history, artifacts, cursors and
/// counters. It is the only state persisted anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Monotone per instance; the latest snapshot has the largest value.
    pub sequence: u64,
    #[serde(flatten)]
    pub state: Checkpoint,
}

impl Snapshot {
    pub fn new(sequence: u64, state: Checkpoint) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            sequence,
            state,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.state.instance_id
    }

    /// State to resume an instance from, history included.
    pub fn into_checkpoint(self) -> Checkpoint {
        let mut state = self.state;
        state.snapshot_sequence = self.sequence;
        state
    }

    /// One-screen description for `orca inspect`.
    pub fn summary(&self) -> SnapshotSummary {
        let state = &self.state;
        SnapshotSummary {
            instance_id: state.instance_id.clone(),
            version: self.version,
            sequence: self.sequence,
            generation: state.generation,
            configured: state.config.is_some(),
            pending: state.pending.iter().map(|t| t.id.to_string()).collect(),
            active_plan: state.active_plan.as_ref().map(|p| p.id.clone()),
            retained_plans: state.plans.len(),
            history_entries: state.history.len(),
            artifacts: state.artifacts.iter().map(|a| a.name.clone()).collect(),
            steps_executed: state.stats.steps_executed,
            steps_failed: state.stats.steps_failed,
            tasks_completed: state.stats.tasks_completed,
            tasks_failed: state.stats.tasks_failed,
            degraded_durability: state.stats.degraded_durability,
        }
    }
}

/// Condensed view of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub instance_id: InstanceId,
    pub version: u32,
    pub sequence: u64,
    pub generation: u64,
    pub configured: bool,
    pub pending: Vec<String>,
    pub active_plan: Option<String>,
    pub retained_plans: usize,
    pub history_entries: usize,
    pub artifacts: Vec<String>,
    pub steps_executed: u64,
    pub steps_failed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub degraded_durability: bool,
}
