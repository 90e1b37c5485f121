//! State carried between instances: identifiers, counters, cursors and the
//! checkpoint a successor instance starts from.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AgentConfig;
use crate::core::artifact::ArtifactSet;
use crate::core::history::HistoryEntry;
use crate::core::plan::Plan;
use crate::core::task::{Task, TaskId};

/// Identifier of one logical agent run. Stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier, for callers that do not name their run.
    pub fn generate() -> Self {
        Self(format!("orca-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How a requested shutdown treats the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Finish in-flight steps, then stop.
    Immediate,
    /// Work through every pending task first.
    Drain,
}

impl ShutdownMode {
    /// Combine two requests; an immediate request always wins.
    pub fn merge(self, other: ShutdownMode) -> ShutdownMode {
        if self == ShutdownMode::Immediate || other == ShutdownMode::Immediate {
            ShutdownMode::Immediate
        } else {
            ShutdownMode::Drain
        }
    }
}

/// Progress markers of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursors {
    /// Last task whose plan resolved.
    #[serde(default)]
    pub last_task_id: Option<TaskId>,
    /// Results of succeeded steps of the active plan, by step name.
    #[serde(default)]
    pub step_results: BTreeMap<String, Value>,
    /// Plans built so far; numbers plan ids.
    #[serde(default)]
    pub plans_created: u64,
}

/// Counters of the run. Cumulative across restarts except
/// `events_since_restart`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub steps_executed: u64,
    pub steps_failed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub errors: u64,
    pub compactions: u64,
    pub snapshots_saved: u64,
    /// Resolved steps at the last snapshot.
    pub last_snapshot_step: u64,
    /// Applied events plus resolved steps since this instance started.
    pub events_since_restart: u64,
    pub generation: u64,
    /// Set once a snapshot save has failed.
    pub degraded_durability: bool,
}

impl RunStats {
    /// Steps that reached a terminal state.
    pub fn steps_resolved(&self) -> u64 {
        self.steps_executed + self.steps_failed
    }
}

/// Everything a successor instance starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: InstanceId,
    pub generation: u64,
    pub config: Option<AgentConfig>,
    pub pending: VecDeque<Task>,
    /// Partially resolved plan of the task at the head of `pending`.
    pub active_plan: Option<Plan>,
    pub plan_overrides: BTreeMap<TaskId, Plan>,
    pub plans: Vec<Plan>,
    pub artifacts: ArtifactSet,
    pub cursors: Cursors,
    pub stats: RunStats,
    /// Empty for restart successors; restored from a snapshot on resume.
    pub history: Vec<HistoryEntry>,
    pub history_next_seq: u64,
    /// Sequence number of the last snapshot written.
    pub snapshot_sequence: u64,
    /// Shutdown requested before a restart, honored by the successor.
    #[serde(skip)]
    pub shutdown: Option<ShutdownMode>,
}

impl Checkpoint {
    /// Starting point of a brand new run.
    pub fn fresh(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            generation: 0,
            config: None,
            pending: VecDeque::new(),
            active_plan: None,
            plan_overrides: BTreeMap::new(),
            plans: Vec::new(),
            artifacts: ArtifactSet::new(),
            cursors: Cursors::default(),
            stats: RunStats::default(),
            history: Vec::new(),
            history_next_seq: 0,
            snapshot_sequence: 0,
            shutdown: None,
        }
    }
}

/// Final report of a stopped run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub instance_id: InstanceId,
    pub generation: u64,
    pub stats: RunStats,
    pub artifacts: ArtifactSet,
    pub plans: Vec<Plan>,
    pub history: Vec<HistoryEntry>,
    /// Tasks still queued when the run stopped.
    pub pending: Vec<TaskId>,
}
