pub mod config;
pub mod core;
pub mod error;
pub mod instance;
pub mod log;
pub mod memory;
pub mod orchestration;
pub mod state;
pub mod util;

pub use config::{AgentConfig, PlannerMode, RetryPolicy};
pub use error::{Error, Result};
pub use instance::{InstanceId, OrchestratorHandle, RunOutcome, RunSummary, Services, Supervisor};
