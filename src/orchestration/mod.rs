//! Orchestration layer: tools, planning and step dispatch.
//!
//! The planner turns tasks into validated plans, and the dispatcher runs
//! ready steps against the tool registry under the configured timeout,
//! retry, concurrency and allow-list policy.

pub mod builtin;
pub mod dispatcher;
pub mod planner;
pub mod tools;

pub use builtin::builtin_registry;
pub use dispatcher::{AttemptRecord, Dispatcher, StepFailure, StepOutcome, StepReport, DEFAULT_QUEUE};
pub use planner::{heuristic_steps, scripted_steps, ModelPlanner, Planner};
pub use tools::{FnTool, Tool, ToolRegistry};
