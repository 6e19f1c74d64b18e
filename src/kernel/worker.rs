//! Worker lifecycle seam and the in-process worker implementation.
//!
//! The bridge never talks to a kernel directly; it spawns workers through a
//! [`WorkerFactory`] and feeds requests into a [`WorkerHandle`]. Replies flow
//! back over the channel handed to the factory at spawn time, so the same
//! bridge runs against an out-of-process kernel or the in-process one used
//! by tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error};

use crate::error::EvalError;
use crate::kernel::protocol::{CorrelationId, KernelFault, KernelRequest, KernelResponse};

/// Something that can answer kernel operations.
///
/// Implementations run inside a worker. An implementation that panics kills
/// its worker, which the bridge observes as a crash and recovers from.
#[async_trait]
pub trait KernelService: Send + Sync {
    async fn perform(&self, operation: &str, params: &Value) -> Result<Value, KernelFault>;
}

/// Spawns kernel workers. Replies from the spawned worker must be delivered
/// on `replies`; dropping the sender signals worker termination.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(
        &self,
        replies: mpsc::UnboundedSender<KernelResponse>,
    ) -> anyhow::Result<Box<dyn WorkerHandle>>;
}

/// Handle to one live worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Queue a request on the worker. Fails if the worker is gone.
    async fn submit(&self, request: KernelRequest) -> Result<(), EvalError>;

    /// Best-effort: tell the worker to stop working on `correlation_id`.
    /// The worker may have already replied; that is fine.
    async fn abort(&self, correlation_id: CorrelationId);

    /// Ask the worker to wind down. Outstanding operations are dropped.
    async fn shutdown(&self);
}

/// Factory for workers that run a [`KernelService`] on the local runtime.
pub struct InProcessWorkerFactory {
    service: Arc<dyn KernelService>,
}

impl InProcessWorkerFactory {
    pub fn new(service: Arc<dyn KernelService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl WorkerFactory for InProcessWorkerFactory {
    async fn spawn(
        &self,
        replies: mpsc::UnboundedSender<KernelResponse>,
    ) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_worker(self.service.clone(), rx, replies));
        Ok(Box::new(InProcessWorker { tx }))
    }
}

struct InProcessWorker {
    tx: mpsc::UnboundedSender<WorkerMsg>,
}

#[async_trait]
impl WorkerHandle for InProcessWorker {
    async fn submit(&self, request: KernelRequest) -> Result<(), EvalError> {
        self.tx
            .send(WorkerMsg::Request(request))
            .map_err(|_| EvalError::WorkerCrashed)
    }

    async fn abort(&self, correlation_id: CorrelationId) {
        let _ = self.tx.send(WorkerMsg::Abort(correlation_id));
    }

    async fn shutdown(&self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
    }
}

enum WorkerMsg {
    Request(KernelRequest),
    Abort(CorrelationId),
    Shutdown,
}

/// Worker driver: accepts requests, runs each operation on its own task so
/// replies can overtake each other, and dies if an operation panics.
async fn drive_worker(
    service: Arc<dyn KernelService>,
    mut inbox: mpsc::UnboundedReceiver<WorkerMsg>,
    replies: mpsc::UnboundedSender<KernelResponse>,
) {
    let mut running: FuturesUnordered<JoinHandle<CorrelationId>> = FuturesUnordered::new();
    let mut abort_handles: HashMap<CorrelationId, AbortHandle> = HashMap::new();

    loop {
        tokio::select! {
            msg = inbox.recv() => match msg {
                Some(WorkerMsg::Request(request)) => {
                    let correlation_id = request.correlation_id;
                    let task = tokio::spawn(run_operation(
                        service.clone(),
                        request,
                        replies.clone(),
                    ));
                    abort_handles.insert(correlation_id, task.abort_handle());
                    running.push(task);
                }
                Some(WorkerMsg::Abort(correlation_id)) => {
                    if let Some(handle) = abort_handles.remove(&correlation_id) {
                        debug!(correlation_id, "aborting kernel operation");
                        handle.abort();
                    }
                }
                Some(WorkerMsg::Shutdown) | None => {
                    debug!("kernel worker shutting down");
                    break;
                }
            },
            Some(finished) = running.next(), if !running.is_empty() => match finished {
                Ok(correlation_id) => {
                    abort_handles.remove(&correlation_id);
                }
                Err(join_err) if join_err.is_panic() => {
                    // A panicking operation takes the whole worker down, the
                    // in-process analogue of a kernel process dying mid-run.
                    error!("kernel operation panicked; terminating worker");
                    break;
                }
                Err(_) => {}
            },
        }
    }

    // Whether dying or winding down, nothing in flight survives the worker.
    // Aborting drops each task's reply sender, which closes the channel.
    for handle in abort_handles.values() {
        handle.abort();
    }
}

async fn run_operation(
    service: Arc<dyn KernelService>,
    request: KernelRequest,
    replies: mpsc::UnboundedSender<KernelResponse>,
) -> CorrelationId {
    let correlation_id = request.correlation_id;
    let response = match service
        .perform(&request.operation_name, &request.operation_params)
        .await
    {
        Ok(result) => KernelResponse::ok(correlation_id, result),
        Err(fault) => KernelResponse::fail(correlation_id, fault),
    };
    let _ = replies.send(response);
    correlation_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Doubler;

    #[async_trait]
    impl KernelService for Doubler {
        async fn perform(&self, operation: &str, params: &Value) -> Result<Value, KernelFault> {
            match operation {
                "double" => {
                    let n = params["n"].as_f64().unwrap_or(0.0);
                    Ok(json!({"n": n * 2.0}))
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!({}))
                }
                "boom" => panic!("kernel died"),
                other => Err(KernelFault::new(format!("unknown operation: {other}"))),
            }
        }
    }

    async fn spawn_worker() -> (
        Box<dyn WorkerHandle>,
        mpsc::UnboundedReceiver<KernelResponse>,
    ) {
        let factory = InProcessWorkerFactory::new(Arc::new(Doubler));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = factory.spawn(tx).await.unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn replies_carry_the_correlation_id() {
        let (worker, mut replies) = spawn_worker().await;
        worker
            .submit(KernelRequest::new(11, "double", json!({"n": 3.0})))
            .await
            .unwrap();
        let response = replies.recv().await.unwrap();
        assert_eq!(response.correlation_id, 11);
        assert!(response.success);
        assert_eq!(response.result.unwrap()["n"], json!(6.0));
    }

    #[tokio::test]
    async fn service_faults_become_failed_responses() {
        let (worker, mut replies) = spawn_worker().await;
        worker
            .submit(KernelRequest::new(1, "nope", json!({})))
            .await
            .unwrap();
        let response = replies.recv().await.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().message.contains("unknown operation"));
    }

    #[tokio::test]
    async fn panicking_operation_closes_the_reply_channel() {
        let (worker, mut replies) = spawn_worker().await;
        worker
            .submit(KernelRequest::new(1, "boom", json!({})))
            .await
            .unwrap();
        // Worker death drops the reply sender, so the channel ends rather
        // than delivering anything.
        assert!(replies.recv().await.is_none());
    }

    #[tokio::test]
    async fn abort_drops_the_operation_silently() {
        let (worker, mut replies) = spawn_worker().await;
        worker
            .submit(KernelRequest::new(5, "slow", json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.abort(5).await;
        worker
            .submit(KernelRequest::new(6, "double", json!({"n": 1.0})))
            .await
            .unwrap();
        let response = replies.recv().await.unwrap();
        assert_eq!(response.correlation_id, 6);
    }
}
