//! Test suite for the evaluator: incremental recompute, caching, scheduling,
//! and failure handling against scripted kernels.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use scriber::{
    EngineConfig, EngineError, EngineEvent, EvalError, EvalOptions, Evaluator, Graph,
    InProcessWorkerFactory, KernelBridge, KernelFault, KernelService, NodeOutcome,
    NodeTypeRegistry, SkipReason, StubKernel,
};
use serde_json::{json, Value};

/// Counts every operation that actually reaches the kernel.
struct Counted {
    inner: Arc<dyn KernelService>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl KernelService for Counted {
    async fn perform(&self, operation: &str, payload: &Value) -> Result<Value, KernelFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.perform(operation, payload).await
    }
}

/// Delays one operation so runs can be cancelled or timed out mid-flight.
struct SlowOp {
    inner: StubKernel,
    operation: &'static str,
    delay: Duration,
}

#[async_trait]
impl KernelService for SlowOp {
    async fn perform(&self, operation: &str, payload: &Value) -> Result<Value, KernelFault> {
        if operation == self.operation {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.perform(operation, payload).await
    }
}

/// Fails one operation with a kernel fault.
struct FaultyOp {
    inner: StubKernel,
    operation: &'static str,
}

#[async_trait]
impl KernelService for FaultyOp {
    async fn perform(&self, operation: &str, payload: &Value) -> Result<Value, KernelFault> {
        if operation == self.operation {
            return Err(KernelFault::coded("solver_error", "operation failed to converge"));
        }
        self.inner.perform(operation, payload).await
    }
}

/// Panics on the first matching operation, then behaves.
struct CrashOnce {
    inner: StubKernel,
    operation: &'static str,
    tripped: AtomicBool,
}

#[async_trait]
impl KernelService for CrashOnce {
    async fn perform(&self, operation: &str, payload: &Value) -> Result<Value, KernelFault> {
        if operation == self.operation && !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("kernel fell over");
        }
        self.inner.perform(operation, payload).await
    }
}

/// Tracks how many operations overlap on the kernel.
struct Overlap {
    inner: StubKernel,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl KernelService for Overlap {
    async fn perform(&self, operation: &str, payload: &Value) -> Result<Value, KernelFault> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = self.inner.perform(operation, payload).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn evaluator_over(service: impl KernelService + 'static) -> (Evaluator, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Counted {
        inner: Arc::new(service),
        calls: calls.clone(),
    };
    let bridge = KernelBridge::new(InProcessWorkerFactory::new(Arc::new(counted)));
    let evaluator = Evaluator::new(EngineConfig::default(), bridge).unwrap();
    (evaluator, calls)
}

fn stub_evaluator() -> (Evaluator, Arc<AtomicUsize>) {
    evaluator_over(StubKernel::new())
}

/// Chain fixture: base feeds moved feeds bounds.
fn chain() -> (Graph, String, String, String) {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let base = graph
        .add_node(
            "solid::box",
            BTreeMap::from([("width".to_string(), json!(4.0))]),
        )
        .unwrap();
    let moved = graph.add_node("xform::translate", BTreeMap::new()).unwrap();
    let bounds = graph
        .add_node("analysis::bounding_box", BTreeMap::new())
        .unwrap();
    graph.bind(&base, "shape", &moved, "shape").unwrap();
    graph.bind(&moved, "shape", &bounds, "shape").unwrap();
    (graph, base, moved, bounds)
}

/// Diamond fixture: two translates of one box, joined by a union.
fn diamond() -> (Graph, String, String, String, String) {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let source = graph.add_node("solid::box", BTreeMap::new()).unwrap();
    let left = graph
        .add_node(
            "xform::translate",
            BTreeMap::from([("offset".to_string(), json!([-1.0, 0.0, 0.0]))]),
        )
        .unwrap();
    let right = graph
        .add_node(
            "xform::translate",
            BTreeMap::from([("offset".to_string(), json!([1.0, 0.0, 0.0]))]),
        )
        .unwrap();
    let joined = graph.add_node("boolean::union", BTreeMap::new()).unwrap();
    graph.bind(&source, "shape", &left, "shape").unwrap();
    graph.bind(&source, "shape", &right, "shape").unwrap();
    graph.bind(&left, "shape", &joined, "a").unwrap();
    graph.bind(&right, "shape", &joined, "b").unwrap();
    (graph, source, left, right, joined)
}

#[tokio::test]
async fn a_clean_graph_reruns_without_dispatching() {
    let (mut graph, _, _, bounds) = chain();
    let (mut evaluator, calls) = stub_evaluator();

    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.stats.dispatched, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let report = evaluator
        .evaluate(&mut graph, &[bounds.as_str()], &EvalOptions::new())
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.stats.dispatched, 0);
    assert_eq!(report.stats.cache_hits, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn leaf_edits_recompute_only_the_downstream_chain() {
    let (mut graph, _, left, _, joined) = diamond();
    let (mut evaluator, calls) = stub_evaluator();

    evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    graph
        .set_param(&left, "offset", json!([-2.0, 0.0, 0.0]))
        .unwrap();
    assert_eq!(graph.dirty_nodes(), vec![left.clone(), joined.clone()]);

    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert!(report.succeeded());
    // The untouched source and right branch resolve from stored results.
    assert_eq!(report.stats.scheduled, 4);
    assert_eq!(report.stats.dispatched, 2);
    assert_eq!(report.stats.cache_hits, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(
        report.outcome(&left),
        Some(&NodeOutcome::Computed { cached: false })
    );
    assert_eq!(
        report.outcome(&joined),
        Some(&NodeOutcome::Computed { cached: false })
    );
}

#[tokio::test]
async fn reverting_a_parameter_restores_cache_hits() {
    let (mut graph, base, ..) = chain();
    let (mut evaluator, calls) = stub_evaluator();

    evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    graph.set_param(&base, "width", json!(9.0)).unwrap();
    evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    // Back to the original value: every result is already in the cache.
    graph.set_param(&base, "width", json!(4.0)).unwrap();
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.stats.dispatched, 0);
    assert_eq!(report.stats.cache_hits, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert!(graph.dirty_nodes().is_empty());
}

#[tokio::test]
async fn shared_upstreams_evaluate_once() {
    let (mut graph, ..) = diamond();
    let (mut evaluator, calls) = stub_evaluator();

    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.stats.scheduled, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn cycles_abort_the_run_before_any_dispatch() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let first = graph.add_node("boolean::union", BTreeMap::new()).unwrap();
    let second = graph.add_node("boolean::union", BTreeMap::new()).unwrap();
    graph.bind(&first, "shape", &second, "a").unwrap();
    graph.bind(&second, "shape", &first, "a").unwrap();

    let (mut evaluator, calls) = stub_evaluator();
    let err = evaluator
        .evaluate(&mut graph, &[first.as_str()], &EvalOptions::new())
        .await
        .unwrap_err();
    match err {
        EngineError::CyclicGraph { nodes } => {
            assert!(nodes.contains(&first));
            assert!(nodes.contains(&second));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn the_concurrency_limit_caps_kernel_overlap() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    for i in 0..6 {
        graph
            .add_node(
                "solid::box",
                BTreeMap::from([("width".to_string(), json!(1.0 + i as f64))]),
            )
            .unwrap();
    }

    let peak = Arc::new(AtomicUsize::new(0));
    let service = Overlap {
        inner: StubKernel::new(),
        in_flight: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
    };
    let (mut evaluator, calls) = evaluator_over(service);

    let options = EvalOptions::new().with_concurrency(2);
    let report = evaluator.evaluate_dirty(&mut graph, &options).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.stats.dispatched, 6);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2, "overlap exceeded the limit");
}

#[tokio::test]
async fn kernel_faults_fail_the_node_and_skip_its_dependents() {
    let (mut graph, base, moved, bounds) = chain();
    let service = FaultyOp {
        inner: StubKernel::new(),
        operation: "xform::translate",
    };
    let (mut evaluator, calls) = evaluator_over(service);

    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    assert_eq!(
        report.outcome(&base),
        Some(&NodeOutcome::Computed { cached: false })
    );
    match report.outcome(&moved) {
        Some(NodeOutcome::Failed(EvalError::Kernel { code, .. })) => {
            assert_eq!(code.as_deref(), Some("solver_error"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    match report.outcome(&bounds) {
        Some(NodeOutcome::Skipped(SkipReason::UpstreamFailed { node })) => {
            assert_eq!(node, &moved);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.skipped, 1);
    // The skipped node never reached the kernel.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.failed_nodes(), vec![moved.as_str()]);

    // Failed and skipped nodes stay dirty for the next run.
    assert_eq!(graph.dirty_nodes(), vec![moved, bounds]);
}

#[tokio::test]
async fn out_of_range_parameters_fail_locally() {
    let (mut graph, base, moved, bounds) = chain();
    graph.set_param(&base, "width", json!(-3.0)).unwrap();

    let (mut evaluator, calls) = stub_evaluator();
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    match report.outcome(&base) {
        Some(NodeOutcome::Failed(EvalError::Validation { param, .. })) => {
            assert_eq!(param, "width");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(
        report.outcome(&moved),
        Some(&NodeOutcome::Skipped(SkipReason::UpstreamFailed {
            node: base.clone()
        }))
    );
    assert!(report.outcome(&bounds).unwrap().is_skipped());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn undeclared_parameters_fail_locally() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let base = graph.add_node("solid::box", BTreeMap::new()).unwrap();
    graph.set_param(&base, "w", json!(3.0)).unwrap();

    let (mut evaluator, calls) = stub_evaluator();
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    match report.outcome(&base) {
        Some(NodeOutcome::Failed(EvalError::Validation { param, reason })) => {
            assert_eq!(param, "w");
            assert!(reason.contains("not declared"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unbound_required_inputs_fail_locally() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let moved = graph.add_node("xform::translate", BTreeMap::new()).unwrap();

    let (mut evaluator, calls) = stub_evaluator();
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    match report.outcome(&moved) {
        Some(NodeOutcome::Failed(EvalError::MissingInput { socket })) => {
            assert_eq!(socket, "shape");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_keeps_finished_work_and_skips_the_rest() {
    let (mut graph, base, moved, bounds) = chain();
    let service = SlowOp {
        inner: StubKernel::new(),
        operation: "xform::translate",
        delay: Duration::from_secs(20),
    };
    let (mut evaluator, _) = evaluator_over(service);

    let options = EvalOptions::new();
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let report = evaluator.evaluate_dirty(&mut graph, &options).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.cancelled);
    assert!(!report.succeeded());
    assert_eq!(
        report.outcome(&base),
        Some(&NodeOutcome::Computed { cached: false })
    );
    assert_eq!(
        report.outcome(&moved),
        Some(&NodeOutcome::Skipped(SkipReason::Cancelled))
    );
    assert_eq!(
        report.outcome(&bounds),
        Some(&NodeOutcome::Skipped(SkipReason::Cancelled))
    );

    // Completed work survives; interrupted work stays dirty.
    let settled = graph.node(&base).unwrap();
    assert!(!settled.dirty());
    assert!(settled.result().is_some());
    assert!(graph.node(&moved).unwrap().dirty());
    assert!(graph.node(&moved).unwrap().result().is_none());
}

#[tokio::test]
async fn timeouts_fail_the_node_and_late_replies_change_nothing() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let base = graph.add_node("solid::box", BTreeMap::new()).unwrap();
    let moved = graph.add_node("xform::translate", BTreeMap::new()).unwrap();
    graph.bind(&base, "shape", &moved, "shape").unwrap();

    let service = SlowOp {
        inner: StubKernel::new(),
        operation: "xform::translate",
        delay: Duration::from_millis(300),
    };
    let (mut evaluator, _) = evaluator_over(service);

    let options = EvalOptions::new().with_timeout(Duration::from_millis(50));
    let report = evaluator.evaluate_dirty(&mut graph, &options).await.unwrap();

    assert!(report.is_computed(&base));
    assert!(matches!(
        report.outcome(&moved),
        Some(NodeOutcome::Failed(EvalError::Timeout { .. }))
    ));

    // The abandoned operation finishes on the worker; its reply is dropped
    // and the node keeps no result.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(evaluator.bridge().stats().late_replies, 1);
    assert!(graph.node(&moved).unwrap().result().is_none());
    assert!(graph.node(&moved).unwrap().dirty());
}

#[tokio::test]
async fn exempt_types_recompute_instead_of_caching() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let noise = graph.add_node("value::random", BTreeMap::new()).unwrap();
    let (mut evaluator, calls) = stub_evaluator();

    evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    graph.set_param(&noise, "max", json!(2.0)).unwrap();
    evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    // Back to the original parameters; a cacheable type would hit here.
    graph.set_param(&noise, "max", json!(1.0)).unwrap();
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    assert_eq!(
        report.outcome(&noise),
        Some(&NodeOutcome::Computed { cached: false })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(evaluator.cache_len(), 0);
}

#[tokio::test]
async fn constants_evaluate_without_the_kernel() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let constant = graph
        .add_node(
            "value::constant",
            BTreeMap::from([("value".to_string(), json!(5.0))]),
        )
        .unwrap();

    let (mut evaluator, calls) = stub_evaluator();
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    assert!(report.is_computed(&constant));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        graph.node(&constant).unwrap().result().unwrap().output("value"),
        Some(&json!(5.0))
    );
}

#[tokio::test]
async fn a_worker_crash_fails_the_node_and_the_rerun_recovers() {
    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let base = graph.add_node("solid::box", BTreeMap::new()).unwrap();

    let service = CrashOnce {
        inner: StubKernel::new(),
        operation: "solid::box",
        tripped: AtomicBool::new(false),
    };
    let (mut evaluator, _) = evaluator_over(service);

    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    match report.outcome(&base) {
        Some(NodeOutcome::Failed(err)) => {
            assert_eq!(err, &EvalError::WorkerCrashed);
            assert!(err.is_retryable());
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(graph.dirty_nodes(), vec![base.clone()]);

    // The next run brings up a replacement worker and succeeds.
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert!(report.is_computed(&base));
    assert_eq!(evaluator.bridge().stats().worker_restarts, 1);
}

#[tokio::test]
async fn events_narrate_the_run_in_order() {
    let (mut graph, ..) = chain();
    let (mut evaluator, _) = stub_evaluator();
    let mut events = evaluator.subscribe();

    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    assert!(report.succeeded());

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let finished = matches!(event, EngineEvent::RunFinished { .. });
        seen.push(event);
        if finished {
            break;
        }
    }

    assert!(matches!(
        seen.first(),
        Some(EngineEvent::RunStarted { scheduled: 3, .. })
    ));
    let starts = seen
        .iter()
        .filter(|event| matches!(event, EngineEvent::NodeStarted { .. }))
        .count();
    let completions = seen
        .iter()
        .filter(|event| matches!(event, EngineEvent::NodeCompleted { cached: false, .. }))
        .count();
    assert_eq!(starts, 3);
    assert_eq!(completions, 3);
    match seen.last() {
        Some(EngineEvent::RunFinished {
            computed,
            failed,
            skipped,
            cancelled,
            ..
        }) => {
            assert_eq!(*computed, 3);
            assert_eq!(*failed, 0);
            assert_eq!(*skipped, 0);
            assert!(!*cancelled);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn an_evaluation_with_no_dirty_nodes_is_a_no_op() {
    let (mut graph, ..) = chain();
    let (mut evaluator, calls) = stub_evaluator();

    evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.stats.scheduled, 0);
    assert!(report.outcomes.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
