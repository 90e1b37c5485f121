//! Core domain models for orca.
//!
//! Tasks, plans and their dependency graph, the history log, and artifacts.

pub mod artifact;
pub mod dag;
pub mod history;
pub mod plan;
pub mod task;

pub use artifact::{Artifact, ArtifactKind, ArtifactSet};
pub use dag::{propagate_failures, ready_steps, PlanGraph};
pub use history::{EntryKind, HistoryEntry, HistoryLog};
pub use plan::{Plan, PlanMode, PlanStep, StepStatus};
pub use task::{Task, TaskId, TaskKind};
