//! Correlation bridge between the engine and a kernel worker.
//!
//! One bridge owns one worker at a time. Dispatches allocate a correlation
//! id, park a oneshot in the pending table, and race the reply against the
//! request deadline and the run's cancel signal. Replies that arrive after
//! their entry is gone are matched and dropped, never re-delivered. If the
//! worker terminates with requests outstanding, every one of them fails
//! with `WorkerCrashed` and the next dispatch starts a replacement worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelSignal;
use crate::engine::events::EngineEvent;
use crate::error::EvalError;
use crate::kernel::protocol::{CorrelationId, KernelRequest, KernelResponse};
use crate::kernel::worker::{WorkerFactory, WorkerHandle};

/// Snapshot of bridge activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Requests handed to a worker.
    pub dispatched: u64,
    /// Replies that resolved a pending request successfully.
    pub completed: u64,
    /// Replies that resolved a pending request with a kernel fault.
    pub failed: u64,
    /// Requests that hit their deadline.
    pub timed_out: u64,
    /// Replies that arrived with no pending entry and were dropped.
    pub late_replies: u64,
    /// Replacement workers started after a crash.
    pub worker_restarts: u64,
}

#[derive(Default)]
struct StatCells {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    late_replies: AtomicU64,
    worker_restarts: AtomicU64,
}

struct PendingRequest {
    node_id: String,
    operation: String,
    deadline: Instant,
    generation: u64,
    reply: oneshot::Sender<Result<serde_json::Value, EvalError>>,
}

struct WorkerSlot {
    handle: Option<Arc<dyn WorkerHandle>>,
    generation: u64,
}

struct BridgeInner {
    factory: Box<dyn WorkerFactory>,
    slot: Mutex<WorkerSlot>,
    pending: DashMap<CorrelationId, PendingRequest>,
    next_correlation: AtomicU64,
    closed: AtomicBool,
    stats: StatCells,
    events: parking_lot::RwLock<Option<async_broadcast::Sender<EngineEvent>>>,
}

/// Clone-cheap handle to the bridge. All clones share the worker, the
/// pending table, and the counters.
#[derive(Clone)]
pub struct KernelBridge {
    inner: Arc<BridgeInner>,
}

impl KernelBridge {
    pub fn new(factory: impl WorkerFactory + 'static) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                factory: Box::new(factory),
                slot: Mutex::new(WorkerSlot {
                    handle: None,
                    generation: 0,
                }),
                pending: DashMap::new(),
                next_correlation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                stats: StatCells::default(),
                events: parking_lot::RwLock::new(None),
            }),
        }
    }

    /// Wire worker lifecycle events into an engine event bus.
    pub(crate) fn set_event_sender(&self, sender: async_broadcast::Sender<EngineEvent>) {
        *self.inner.events.write() = Some(sender);
    }

    /// Send one operation to the kernel and await its outcome.
    ///
    /// Resolution is the first of: a matched reply, the deadline, or the
    /// cancel signal. On timeout the operation is left to finish on the
    /// worker; its eventual reply is dropped. On cancel the worker gets a
    /// best-effort abort.
    #[instrument(skip(self, params, cancel), fields(node_id = %node_id, operation = %operation))]
    pub async fn dispatch(
        &self,
        node_id: &str,
        operation: &str,
        params: serde_json::Value,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<serde_json::Value, EvalError> {
        if cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        let (worker, generation) = self.ensure_worker().await?;

        let correlation_id = self.inner.next_correlation.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(
            correlation_id,
            PendingRequest {
                node_id: node_id.to_string(),
                operation: operation.to_string(),
                deadline: Instant::now() + timeout,
                generation,
                reply: reply_tx,
            },
        );

        let request = KernelRequest::new(correlation_id, operation, params);
        self.inner.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id, "dispatching kernel request");

        if worker.submit(request).await.is_err() {
            self.inner.pending.remove(&correlation_id);
            self.handle_worker_exit(generation).await;
            return Err(EvalError::WorkerCrashed);
        }

        let started = Instant::now();
        tokio::select! {
            resolved = reply_rx => match resolved {
                Ok(outcome) => outcome,
                // The pending entry was dropped without resolution; only a
                // crash sweep racing this select can cause it.
                Err(_) => Err(EvalError::WorkerCrashed),
            },
            _ = tokio::time::sleep(timeout) => {
                self.inner.pending.remove(&correlation_id);
                self.inner.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(correlation_id, elapsed_ms = started.elapsed().as_millis() as u64,
                    "kernel request timed out");
                Err(EvalError::Timeout { elapsed: started.elapsed() })
            },
            _ = cancel.cancelled() => {
                self.inner.pending.remove(&correlation_id);
                worker.abort(correlation_id).await;
                debug!(correlation_id, "kernel request cancelled");
                Err(EvalError::Cancelled)
            },
        }
    }

    /// Number of requests currently awaiting replies.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn stats(&self) -> BridgeStats {
        let cells = &self.inner.stats;
        BridgeStats {
            dispatched: cells.dispatched.load(Ordering::Relaxed),
            completed: cells.completed.load(Ordering::Relaxed),
            failed: cells.failed.load(Ordering::Relaxed),
            timed_out: cells.timed_out.load(Ordering::Relaxed),
            late_replies: cells.late_replies.load(Ordering::Relaxed),
            worker_restarts: cells.worker_restarts.load(Ordering::Relaxed),
        }
    }

    /// Stop the current worker and reject future dispatches as crashed.
    /// Pending requests fail with `WorkerCrashed`.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let handle = {
            let mut slot = self.inner.slot.lock().await;
            slot.handle.take()
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        reject_pending(&self.inner, None);
    }

    async fn ensure_worker(&self) -> Result<(Arc<dyn WorkerHandle>, u64), EvalError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EvalError::WorkerCrashed);
        }
        let mut slot = self.inner.slot.lock().await;
        if let Some(handle) = &slot.handle {
            return Ok((handle.clone(), slot.generation));
        }

        let generation = slot.generation + 1;
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let handle: Arc<dyn WorkerHandle> = match self.inner.factory.spawn(reply_tx).await {
            Ok(handle) => Arc::from(handle),
            Err(err) => {
                warn!(error = %err, "failed to spawn kernel worker");
                return Err(EvalError::WorkerCrashed);
            }
        };
        slot.handle = Some(handle.clone());
        slot.generation = generation;
        drop(slot);

        tokio::spawn(reply_pump(
            Arc::downgrade(&self.inner),
            reply_rx,
            generation,
        ));

        if generation > 1 {
            self.inner
                .stats
                .worker_restarts
                .fetch_add(1, Ordering::Relaxed);
            info!(generation, "started replacement kernel worker");
            emit(&self.inner, EngineEvent::WorkerRestarted { generation });
        } else {
            debug!(generation, "started kernel worker");
        }
        Ok((handle, generation))
    }

    async fn handle_worker_exit(&self, generation: u64) {
        handle_worker_exit(&self.inner, generation).await;
    }
}

/// Drains replies from one worker until its channel closes, then runs the
/// crash path for that worker generation.
async fn reply_pump(
    inner: Weak<BridgeInner>,
    mut replies: mpsc::UnboundedReceiver<KernelResponse>,
    generation: u64,
) {
    while let Some(response) = replies.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        resolve_reply(&inner, response);
    }
    if let Some(inner) = inner.upgrade() {
        handle_worker_exit(&inner, generation).await;
    }
}

fn resolve_reply(inner: &BridgeInner, response: KernelResponse) {
    let correlation_id = response.correlation_id;
    let Some((_, entry)) = inner.pending.remove(&correlation_id) else {
        inner.stats.late_replies.fetch_add(1, Ordering::Relaxed);
        warn!(
            correlation_id,
            "late kernel reply has no pending request; dropping"
        );
        return;
    };

    let overdue = entry.deadline.checked_duration_since(Instant::now()).is_none();
    if overdue {
        debug!(correlation_id, node_id = %entry.node_id, "reply arrived past deadline");
    }

    let outcome = if response.success {
        match response.result {
            Some(value) => {
                inner.stats.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            None => {
                inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(EvalError::kernel("successful reply carried no result"))
            }
        }
    } else {
        inner.stats.failed.fetch_add(1, Ordering::Relaxed);
        let fault = response.error;
        let (code, message) = match fault {
            Some(fault) => (fault.code, fault.message),
            None => (None, format!("operation '{}' failed", entry.operation)),
        };
        Err(EvalError::Kernel { code, message })
    };
    let _ = entry.reply.send(outcome);
}

async fn handle_worker_exit(inner: &Arc<BridgeInner>, generation: u64) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    {
        let mut slot = inner.slot.lock().await;
        if slot.generation != generation {
            // A replacement already took over; nothing to do for this exit.
            return;
        }
        if slot.handle.take().is_none() {
            return;
        }
    }
    warn!(generation, "kernel worker terminated unexpectedly");
    reject_pending(inner, Some(generation));
}

/// Fail pending requests with `WorkerCrashed`. `generation` limits the sweep
/// to requests that were in flight on that worker.
fn reject_pending(inner: &BridgeInner, generation: Option<u64>) {
    let doomed: Vec<CorrelationId> = inner
        .pending
        .iter()
        .filter(|entry| generation.map_or(true, |g| entry.generation == g))
        .map(|entry| *entry.key())
        .collect();
    for correlation_id in doomed {
        if let Some((_, entry)) = inner.pending.remove(&correlation_id) {
            debug!(correlation_id, node_id = %entry.node_id, "rejecting pending request after worker exit");
            let _ = entry.reply.send(Err(EvalError::WorkerCrashed));
        }
    }
}

fn emit(inner: &BridgeInner, event: EngineEvent) {
    if let Some(sender) = inner.events.read().as_ref() {
        let _ = sender.try_broadcast(event);
    }
}

/// Per-node handle passed into node evaluations.
///
/// Carries the bridge, the effective deadline, and the run's cancel signal.
/// A node evaluation may issue at most one kernel request; a second
/// `invoke` on the same context fails without reaching the worker.
pub struct KernelCtx {
    node_id: String,
    bridge: KernelBridge,
    timeout: Duration,
    cancel: CancelSignal,
    invoked: AtomicBool,
}

impl KernelCtx {
    pub fn new(
        node_id: impl Into<String>,
        bridge: KernelBridge,
        timeout: Duration,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            bridge,
            timeout,
            cancel,
            invoked: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Issue this evaluation's single kernel operation.
    pub async fn invoke(
        &self,
        operation: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, EvalError> {
        if self.invoked.swap(true, Ordering::SeqCst) {
            return Err(EvalError::contract(
                "node evaluation issued a second kernel request",
            ));
        }
        self.bridge
            .dispatch(&self.node_id, operation, params, self.timeout, &self.cancel)
            .await
    }
}
