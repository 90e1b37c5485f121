//! Supervisor: keeps a logical run alive across instance restarts.
//!
//! An instance that reaches its restart threshold hands back a checkpoint
//! and its mailbox. The supervisor starts the successor from them, so
//! callers holding an [`OrchestratorHandle`] never notice the swap. At
//! startup it resumes from the latest stored snapshot, if there is one. A
//! snapshot that cannot be read leaves the run going in memory with
//! durability marked degraded.

use tokio::task::JoinHandle;

use crate::core::history::{EntryKind, HistoryEntry};
use crate::instance::checkpoint::{Checkpoint, InstanceId, RunSummary};
use crate::instance::events::{Mailbox, OrchestratorHandle};
use crate::instance::orchestrator::{Orchestrator, RunOutcome, Services};
use crate::util::digest;
use crate::{Error, Result};

#[derive(Debug)]
pub struct Supervisor {
    instance_id: InstanceId,
    services: Services,
    initial: Option<Checkpoint>,
}

impl Supervisor {
    pub fn new(instance_id: InstanceId, services: Services) -> Self {
        Self {
            instance_id,
            services,
            initial: None,
        }
    }

    /// Start from `checkpoint` instead of the store.
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.initial = Some(checkpoint);
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Where the first instance starts: an explicit checkpoint, else the
    /// latest stored snapshot, else a fresh run. A store that fails to
    /// load yields a fresh run carrying the failure in its history.
    pub async fn initial_checkpoint(&self) -> Checkpoint {
        if let Some(checkpoint) = &self.initial {
            return checkpoint.clone();
        }
        let Some(store) = &self.services.store else {
            return Checkpoint::fresh(self.instance_id.clone());
        };
        match store.load(&self.instance_id).await {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    instance = %self.instance_id,
                    sequence = snapshot.sequence,
                    generation = snapshot.state.generation,
                    pending = snapshot.state.pending.len(),
                    "Resuming from snapshot"
                );
                let mut checkpoint = snapshot.into_checkpoint();
                checkpoint.stats.events_since_restart = 0;
                checkpoint
            }
            Ok(None) => {
                tracing::debug!(instance = %self.instance_id, "No snapshot, starting fresh");
                Checkpoint::fresh(self.instance_id.clone())
            }
            Err(error) => {
                tracing::warn!(
                    instance = %self.instance_id,
                    error = %error,
                    "Snapshot load failed, continuing in memory"
                );
                self.unreadable_snapshot(&error)
            }
        }
    }

    fn unreadable_snapshot(&self, error: &Error) -> Checkpoint {
        let mut checkpoint = Checkpoint::fresh(self.instance_id.clone());
        checkpoint.history.push(
            HistoryEntry::new(EntryKind::Error, "snapshot", digest(&self.instance_id))
                .with_error(error.to_string())
                .with_tag("PersistenceError")
                .with_seq(0),
        );
        checkpoint.history_next_seq = 1;
        checkpoint.stats.errors += 1;
        checkpoint.stats.degraded_durability = true;
        checkpoint
    }

    /// Run instances until one stops, starting a successor after every
    /// restart.
    pub async fn run(self, mailbox: Mailbox) -> Result<RunSummary> {
        let mut checkpoint = self.initial_checkpoint().await;
        let mut mailbox = mailbox;
        loop {
            let generation = checkpoint.generation;
            let instance = Orchestrator::new(checkpoint, mailbox, self.services.clone());
            match instance.run().await? {
                RunOutcome::Stopped(summary) => {
                    tracing::info!(
                        instance = %self.instance_id,
                        generation,
                        "Run finished"
                    );
                    return Ok(summary);
                }
                RunOutcome::Restarted {
                    checkpoint: next,
                    mailbox: carried,
                } => {
                    tracing::info!(
                        instance = %self.instance_id,
                        from = generation,
                        to = next.generation,
                        "Starting successor instance"
                    );
                    checkpoint = next;
                    mailbox = carried;
                }
            }
        }
    }

    /// Spawn the supervised run on the current runtime.
    pub fn launch(self) -> (OrchestratorHandle, JoinHandle<Result<RunSummary>>) {
        let (handle, mailbox) = OrchestratorHandle::channel(self.instance_id.clone());
        let task = tokio::spawn(self.run(mailbox));
        (handle, task)
    }
}
