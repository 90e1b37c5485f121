//! Instance phases with transition validation.
//!
//! `PhaseTracker` records the phase an orchestrator instance is in and
//! rejects transitions the run loop must never make:
//!
//! AwaitingConfiguration -> Idle -> Planning -> Dispatching -> Persisting
//! -> (Compacting ->) Idle, with `ShuttingDown -> Stopped` reachable from
//! every non-terminal phase and `CheckpointingForRestart -> Restarted`
//! reachable from Idle.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    AwaitingConfiguration,
    Idle,
    Planning,
    Dispatching,
    Persisting,
    Compacting,
    ShuttingDown,
    Stopped,
    CheckpointingForRestart,
    Restarted,
}

impl InstancePhase {
    /// Whether the instance has finished its run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstancePhase::Stopped | InstancePhase::Restarted)
    }

    fn can_shut_down(&self) -> bool {
        matches!(
            self,
            InstancePhase::AwaitingConfiguration
                | InstancePhase::Idle
                | InstancePhase::Planning
                | InstancePhase::Dispatching
                | InstancePhase::Persisting
                | InstancePhase::Compacting
        )
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstancePhase::AwaitingConfiguration => "awaiting_configuration",
            InstancePhase::Idle => "idle",
            InstancePhase::Planning => "planning",
            InstancePhase::Dispatching => "dispatching",
            InstancePhase::Persisting => "persisting",
            InstancePhase::Compacting => "compacting",
            InstancePhase::ShuttingDown => "shutting_down",
            InstancePhase::Stopped => "stopped",
            InstancePhase::CheckpointingForRestart => "checkpointing_for_restart",
            InstancePhase::Restarted => "restarted",
        };
        write!(f, "{}", name)
    }
}

/// Current phase of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTracker {
    current: InstancePhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new(InstancePhase::AwaitingConfiguration)
    }
}

impl PhaseTracker {
    pub fn new(initial: InstancePhase) -> Self {
        Self { current: initial }
    }

    pub fn can_transition(&self, target: InstancePhase) -> bool {
        use InstancePhase::*;
        if target == ShuttingDown {
            return self.current.can_shut_down();
        }
        matches!(
            (self.current, target),
            (AwaitingConfiguration, Idle)
                | (Idle, Planning)
                | (Idle, CheckpointingForRestart)
                | (Planning, Dispatching)
                | (Planning, Persisting)
                | (Dispatching, Persisting)
                | (Persisting, Idle)
                | (Persisting, Compacting)
                | (Compacting, Idle)
                | (ShuttingDown, Stopped)
                | (CheckpointingForRestart, Restarted)
        )
    }

    /// Move to `target`.
    ///
    /// # Errors
    /// Returns `Error::InvalidPhaseTransition` and stays put if `target`
    /// is not reachable from the current phase.
    pub fn transition(&mut self, target: InstancePhase) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        tracing::trace!(from = %self.current, to = %target, "Phase transition");
        self.current = target;
        Ok(())
    }

    pub fn current(&self) -> InstancePhase {
        self.current
    }
}
