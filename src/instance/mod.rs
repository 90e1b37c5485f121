//! Orchestrator instances and the machinery around them.
//!
//! - `events`: the mailbox, the handle callers hold, and the event types
//! - `orchestrator`: the single-writer actor that owns a run
//! - `phase`: validated instance phases
//! - `checkpoint`: state carried between instances
//! - `supervisor`: restarts and resume-from-snapshot

pub mod checkpoint;
pub mod events;
pub mod orchestrator;
pub mod phase;
pub mod supervisor;

pub use checkpoint::{Checkpoint, Cursors, InstanceId, RunStats, RunSummary, ShutdownMode};
pub use events::{Envelope, Event, Mailbox, OrchestratorHandle};
pub use orchestrator::{Orchestrator, RunOutcome, Services, MAX_RETAINED_PLANS};
pub use phase::{InstancePhase, PhaseTracker};
pub use supervisor::Supervisor;
