//! Events delivered to an orchestrator instance and the handle that sends
//! them.
//!
//! Every event travels through one unbounded mpsc channel, so the instance
//! applies them strictly one at a time. Each event carries a oneshot sender
//! the instance answers once the event has been applied; configuration and
//! plan-structure errors come back that way.

use tokio::sync::{mpsc, oneshot};

use crate::config::AgentConfig;
use crate::core::history::HistoryEntry;
use crate::core::plan::Plan;
use crate::core::task::Task;
use crate::instance::checkpoint::InstanceId;
use crate::{Error, Result};

/// Inbound event.
#[derive(Debug, Clone)]
pub enum Event {
    Configure(AgentConfig),
    EnqueueTask(Task),
    InjectMemory(Vec<HistoryEntry>),
    SetPlan(Plan),
    /// `drain: false` stops after in-flight steps finish; `drain: true`
    /// works through the pending queue first.
    Shutdown { drain: bool },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Configure(_) => "configure",
            Event::EnqueueTask(_) => "enqueue_task",
            Event::InjectMemory(_) => "inject_memory",
            Event::SetPlan(_) => "set_plan",
            Event::Shutdown { drain: false } => "shutdown",
            Event::Shutdown { drain: true } => "shutdown_when_idle",
        }
    }
}

/// An event plus the channel its acknowledgement goes to.
#[derive(Debug)]
pub struct Envelope {
    pub event: Event,
    pub ack: Option<oneshot::Sender<Result<()>>>,
}

impl Envelope {
    /// Answer the sender. A sender that stopped waiting is ignored.
    pub fn acknowledge(self, result: Result<()>) {
        if let Some(ack) = self.ack {
            let _ = ack.send(result);
        }
    }
}

/// Receiving side of an instance's event channel.
///
/// Outlives a single instance: on restart it moves to the successor, so
/// events sent during the handover are not lost.
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Mailbox {
    /// Wait for the next event. `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> std::result::Result<Envelope, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Sending side of an instance's event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    instance_id: InstanceId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl OrchestratorHandle {
    /// Create a handle and the mailbox it delivers to.
    pub fn channel(instance_id: InstanceId) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { instance_id, tx }, Mailbox { rx })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Whether the instance can no longer receive events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Deliver an event and wait until the instance has applied it.
    pub async fn send(&self, event: Event) -> Result<()> {
        let name = event.name();
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Envelope {
                event,
                ack: Some(ack),
            })
            .map_err(|_| Error::InstanceClosed(format!("{} not delivered", name)))?;
        done.await
            .map_err(|_| Error::InstanceClosed(format!("{} not acknowledged", name)))?
    }

    /// Deliver an event without waiting for it to be applied.
    pub fn post(&self, event: Event) -> Result<()> {
        let name = event.name();
        self.tx
            .send(Envelope { event, ack: None })
            .map_err(|_| Error::InstanceClosed(format!("{} not delivered", name)))
    }

    pub async fn configure(&self, config: AgentConfig) -> Result<()> {
        self.send(Event::Configure(config)).await
    }

    pub async fn enqueue_task(&self, task: Task) -> Result<()> {
        self.send(Event::EnqueueTask(task)).await
    }

    pub async fn inject_memory(&self, entries: Vec<HistoryEntry>) -> Result<()> {
        self.send(Event::InjectMemory(entries)).await
    }

    pub async fn set_plan(&self, plan: Plan) -> Result<()> {
        self.send(Event::SetPlan(plan)).await
    }

    /// Stop starting new steps, let in-flight steps finish, then stop.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown { drain: false }).await
    }

    /// Finish every pending task, then stop.
    pub async fn shutdown_when_idle(&self) -> Result<()> {
        self.send(Event::Shutdown { drain: true }).await
    }
}
