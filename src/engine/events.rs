//! Engine event stream.
//!
//! Evaluation progress is broadcast on a bounded channel with overflow
//! enabled: emitting never blocks the evaluator, and a slow subscriber
//! loses the oldest events rather than stalling a run. Subscribers learn
//! about dropped events through `RecvError::Overflowed`.

use serde::{Deserialize, Serialize};

/// Lifecycle notifications for runs, nodes, and the kernel worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: String,
        scheduled: usize,
    },
    /// A node evaluation was dispatched. Cache hits skip straight to
    /// `NodeCompleted`.
    NodeStarted {
        run_id: String,
        node_id: String,
    },
    NodeCompleted {
        run_id: String,
        node_id: String,
        cached: bool,
    },
    NodeFailed {
        run_id: String,
        node_id: String,
        error: String,
    },
    NodeSkipped {
        run_id: String,
        node_id: String,
        reason: String,
    },
    RunFinished {
        run_id: String,
        computed: usize,
        failed: usize,
        skipped: usize,
        cancelled: bool,
    },
    /// A replacement kernel worker came up after a crash.
    WorkerRestarted {
        generation: u64,
    },
}

/// Broadcast bus for [`EngineEvent`]s.
pub struct EventBus {
    tx: async_broadcast::Sender<EngineEvent>,
    // Keeps the channel open while no subscriber is active.
    _idle: async_broadcast::InactiveReceiver<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            tx,
            _idle: rx.deactivate(),
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<EngineEvent> {
        self.tx.new_receiver()
    }

    /// Fire and forget. Without active subscribers the event is dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.try_broadcast(event);
    }

    pub(crate) fn sender(&self) -> async_broadcast::Sender<EngineEvent> {
        self.tx.clone()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
