//! Submission gate: hands one resolved unit (or node reference) to the
//! backend and waits for a terminal outcome, unless the run is cancelled.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::watch;

use stepchain_types::{ChainError, Result, UnitOutcome};

use crate::backend::{ExecutionBackend, SubmitMode, UnitHandle};

// ---------------------------------------------------------------------------
// CancelHandle
// ---------------------------------------------------------------------------

/// Cooperative cancellation shared between a caller and a running chain.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.sender.subscribe();
        // The sender lives as long as `self`, so `wait_for` only fails if the
        // handle is gone, which cannot happen while borrowed.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// What the gate is asked to run.
#[derive(Debug)]
pub enum Dispatch<'a> {
    Unit {
        handle: &'a UnitHandle,
        inputs: Map<String, Value>,
    },
    Reference(i64),
}

/// Run `request` to completion, or fail with [`ChainError::Cancelled`].
///
/// Dropping the backend future on cancellation is the backend's signal to
/// abandon the work.
pub async fn dispatch(
    backend: &dyn ExecutionBackend,
    request: Dispatch<'_>,
    cancel: &CancelHandle,
) -> Result<UnitOutcome> {
    if cancel.is_cancelled() {
        return Err(ChainError::Cancelled);
    }

    let work = async {
        match request {
            Dispatch::Reference(node) => backend.load(node).await,
            Dispatch::Unit { handle, inputs } => match handle.mode {
                SubmitMode::Inline => backend.run_inline(handle, inputs).await,
                SubmitMode::Async => backend.submit(handle, inputs).await,
            },
        }
    };

    tokio::select! {
        outcome = work => outcome,
        _ = cancel.cancelled() => {
            tracing::warn!(backend = backend.name(), "Cancelled while waiting on backend");
            Err(ChainError::Cancelled)
        }
    }
}
