//! Events published for every phase transition of a run.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::{LoopPhase, TerminationReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub step_index: u32,
    pub phase: LoopPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_summary: Option<String>,
    pub progress_summary: String,
    /// Set on the final event of a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

impl RunEvent {
    pub fn is_final(&self) -> bool {
        self.termination_reason.is_some()
    }
}

/// Cheap cloneable publisher. Sending with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<RunEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
