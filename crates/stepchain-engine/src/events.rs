//! Chain event system for observability.
//!
//! Emits [`ChainEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (progress printers, log shippers) can follow a run
//! without coupling to the executor.

use serde::{Deserialize, Serialize};

/// Events emitted during chain execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainEvent {
    ChainStarted {
        run_id: String,
        step_count: usize,
    },
    SetupCompleted {
        expressions: usize,
    },
    StepSkipped {
        step: usize,
        label: String,
    },
    LoopEntered {
        step: usize,
        depth: usize,
    },
    LoopRepeated {
        step: usize,
    },
    LoopExited {
        step: usize,
    },
    UnitDispatched {
        step: usize,
        ordinal: usize,
        label: String,
    },
    UnitCompleted {
        step: usize,
        ordinal: usize,
        success: bool,
        code: i32,
        duration_ms: u64,
    },
    ContextUpdated {
        ordinal: usize,
        keys: Vec<String>,
    },
    ChainCompleted {
        run_id: String,
        results: usize,
        duration_ms: u64,
    },
    ChainAborted {
        run_id: String,
        code: i32,
        message: Option<String>,
    },
    ChainFailed {
        run_id: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<ChainEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: ChainEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
