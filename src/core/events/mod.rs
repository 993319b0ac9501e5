//! Event Bus
//!
//! The core never talks to a UI toolkit. Everything observable (queue changes,
//! stage status transitions, review checkpoints, batch lifecycle) is published
//! on a broadcast bus that any number of collaborators can subscribe to.

use tokio::sync::broadcast;

use crate::core::{BatchStatus, JobId, LangId, StageKey, StageStatus};

/// Buffered events per subscriber before old entries are dropped
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the orchestration core
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// A job was appended to the queue
    TaskAdded { job_id: JobId },
    /// The queue's structure changed (add/delete/clear)
    QueueUpdated,
    /// A stage moved to a new status; emitted exactly once per transition
    StageStatusChanged {
        job_id: JobId,
        lang_id: LangId,
        stage: StageKey,
        status: StageStatus,
    },
    /// A processing batch started
    ProcessingStarted,
    /// The batch finished; `elapsed` is wall clock formatted as `HH:MM:SS`
    ProcessingFinished {
        elapsed: String,
        status: BatchStatus,
    },
    /// Every stage of every language of one job reached a terminal state
    JobFinished { job_id: JobId, status: BatchStatus },
    /// Generated text is waiting for a reviewer decision
    ReviewRequired {
        job_id: JobId,
        lang_id: LangId,
        candidate_text: String,
    },
    /// A regeneration produced a fresh candidate
    Regenerated { job_id: JobId, new_text: String },
}

/// Cloneable handle to the shared event channel
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribes a new receiver; events emitted before the call are not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Sends with no live subscriber are dropped silently.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
