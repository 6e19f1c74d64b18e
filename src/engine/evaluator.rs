//! The evaluation orchestrator.
//!
//! One `evaluate` call resolves a deterministic plan, then drives it with a
//! bounded launch budget. Node evaluations run as detached futures that
//! only ever produce a value; the graph and the cache are touched
//! exclusively on the orchestrating task when completions are applied, so
//! no lock sits around either. Failures cascade as skips to everything
//! downstream, and only a dependency cycle aborts the run as a whole.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelSignal;
use crate::catalog::types::ResolvedInputs;
use crate::config::{EngineConfig, EvalOptions};
use crate::engine::cache::{CacheKey, CacheStats, ResultCache};
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::report::{EvaluationReport, NodeOutcome, RunStats, SkipReason};
use crate::engine::resolver;
use crate::error::{EngineResult, EvalError};
use crate::graph::graph::Graph;
use crate::graph::node::{NodeId, NodeResult};
use crate::kernel::bridge::{KernelBridge, KernelCtx};

enum Slot {
    Waiting,
    Running,
    Done(NodeOutcome),
}

type EvalFuture = BoxFuture<'static, (NodeId, Result<BTreeMap<String, Value>, EvalError>)>;

enum Prepared {
    /// Satisfiable without evaluation: an up-to-date stored result or a
    /// cache entry.
    Hit(Arc<NodeResult>),
    /// Needs a fresh evaluation. The key is present for cacheable types.
    Fresh(Option<CacheKey>, EvalFuture),
    /// Failed local validation; never dispatched.
    Invalid(EvalError),
}

/// Drives evaluation runs against one graph at a time.
pub struct Evaluator {
    config: EngineConfig,
    bridge: KernelBridge,
    cache: ResultCache,
    events: EventBus,
}

impl Evaluator {
    pub fn new(config: EngineConfig, bridge: KernelBridge) -> EngineResult<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        bridge.set_event_sender(events.sender());
        let cache = ResultCache::new(config.cache_capacity);
        Ok(Self {
            config,
            bridge,
            cache,
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bridge(&self) -> &KernelBridge {
        &self.bridge
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Evaluate every dirty node. A fully clean graph is a no-op run.
    pub async fn evaluate_dirty(
        &mut self,
        graph: &mut Graph,
        options: &EvalOptions,
    ) -> EngineResult<EvaluationReport> {
        let dirty = graph.dirty_nodes();
        let roots: Vec<&str> = dirty.iter().map(String::as_str).collect();
        self.evaluate(graph, &roots, options).await
    }

    /// Evaluate `roots` and whatever upstream state they need.
    ///
    /// Per-node faults land in the report; the only hard error out of a
    /// resolved plan is a dependency cycle, which aborts before anything
    /// dispatches.
    #[instrument(skip_all)]
    pub async fn evaluate(
        &mut self,
        graph: &mut Graph,
        roots: &[&str],
        options: &EvalOptions,
    ) -> EngineResult<EvaluationReport> {
        let run_id = cuid2::create_id();
        let started_at = Utc::now();
        let (limit, timeout) = options.resolve(&self.config);
        let order = resolver::upstream_order(graph, roots)?;

        info!(run_id = %run_id, scheduled = order.len(), limit, "evaluation run started");
        self.events.emit(EngineEvent::RunStarted {
            run_id: run_id.clone(),
            scheduled: order.len(),
        });

        let mut slots: HashMap<NodeId, Slot> = order
            .iter()
            .map(|id| (id.clone(), Slot::Waiting))
            .collect();
        let deps: HashMap<NodeId, Vec<NodeId>> = order
            .iter()
            .map(|id| (id.clone(), graph.upstream_of(id)))
            .collect();
        let mut launched_keys: HashMap<NodeId, CacheKey> = HashMap::new();
        let mut in_flight: FuturesUnordered<EvalFuture> = FuturesUnordered::new();
        let mut running = 0usize;
        let mut stats = RunStats {
            scheduled: order.len(),
            ..RunStats::default()
        };

        loop {
            if options.cancel.is_cancelled() {
                for id in &order {
                    if matches!(slots[id], Slot::Waiting) {
                        self.record_skip(&run_id, id, SkipReason::Cancelled, &mut slots, &mut stats);
                    }
                }
            }

            // Launch and cascade skips until the scan stops moving.
            loop {
                let mut progressed = false;
                for id in &order {
                    if !matches!(slots[id], Slot::Waiting) {
                        continue;
                    }
                    let mut blocked = false;
                    let mut skip: Option<SkipReason> = None;
                    for dep in &deps[id] {
                        match slots.get(dep) {
                            Some(Slot::Done(NodeOutcome::Computed { .. })) => {}
                            Some(Slot::Done(_)) => {
                                skip = Some(SkipReason::UpstreamFailed { node: dep.clone() });
                                break;
                            }
                            _ => {
                                blocked = true;
                                break;
                            }
                        }
                    }
                    if blocked {
                        continue;
                    }
                    if let Some(reason) = skip {
                        self.record_skip(&run_id, id, reason, &mut slots, &mut stats);
                        progressed = true;
                        continue;
                    }
                    // Skips above cost nothing; launches respect the budget.
                    if running >= limit {
                        continue;
                    }
                    match self.prepare(graph, id, timeout, &options.cancel)? {
                        Prepared::Hit(result) => {
                            let changed = graph.adopt_result(id, result)?;
                            slots.insert(
                                id.clone(),
                                Slot::Done(NodeOutcome::Computed { cached: true }),
                            );
                            stats.cache_hits += 1;
                            debug!(run_id = %run_id, node_id = %id, changed, "node satisfied from cache");
                            self.events.emit(EngineEvent::NodeCompleted {
                                run_id: run_id.clone(),
                                node_id: id.clone(),
                                cached: true,
                            });
                            progressed = true;
                        }
                        Prepared::Invalid(err) => {
                            warn!(run_id = %run_id, node_id = %id, error = %err, "node failed before dispatch");
                            self.record_failure(&run_id, id, err, &mut slots, &mut stats);
                            progressed = true;
                        }
                        Prepared::Fresh(key, future) => {
                            if let Some(key) = key {
                                launched_keys.insert(id.clone(), key);
                            }
                            in_flight.push(future);
                            slots.insert(id.clone(), Slot::Running);
                            running += 1;
                            stats.dispatched += 1;
                            debug!(run_id = %run_id, node_id = %id, "node dispatched");
                            self.events.emit(EngineEvent::NodeStarted {
                                run_id: run_id.clone(),
                                node_id: id.clone(),
                            });
                            progressed = true;
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }

            if running == 0 {
                if order
                    .iter()
                    .all(|id| matches!(slots[id], Slot::Done(_)))
                {
                    break;
                }
                if options.cancel.is_cancelled() {
                    continue;
                }
                // Unreachable with a valid topological order; bail out
                // rather than spin.
                warn!(run_id = %run_id, "evaluation stalled with no runnable nodes");
                for id in &order {
                    if matches!(slots[id], Slot::Waiting) {
                        let err = EvalError::contract("evaluation stalled with no runnable nodes");
                        self.record_failure(&run_id, id, err, &mut slots, &mut stats);
                    }
                }
                continue;
            }

            tokio::select! {
                Some((id, result)) = in_flight.next() => {
                    running -= 1;
                    let key = launched_keys.remove(&id).filter(|_| result.is_ok());
                    self.finish(graph, &run_id, &id, result, key, &mut slots, &mut stats)?;
                }
                _ = options.cancel.cancelled(), if !options.cancel.is_cancelled() => {}
            }
        }

        let cancelled = options.cancel.is_cancelled();
        let outcomes: BTreeMap<NodeId, NodeOutcome> = slots
            .into_iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Done(outcome) => Some((id, outcome)),
                _ => None,
            })
            .collect();
        let finished_at = Utc::now();

        info!(
            run_id = %run_id,
            computed = stats.computed(),
            cache_hits = stats.cache_hits,
            dispatched = stats.dispatched,
            failed = stats.failed,
            skipped = stats.skipped,
            cancelled,
            "evaluation run finished"
        );
        self.events.emit(EngineEvent::RunFinished {
            run_id: run_id.clone(),
            computed: stats.computed(),
            failed: stats.failed,
            skipped: stats.skipped,
            cancelled,
        });

        Ok(EvaluationReport {
            run_id,
            outcomes,
            stats,
            started_at,
            finished_at,
            cancelled,
        })
    }

    /// Classify one node for this run: short-circuit, cache hit, or a
    /// dispatchable future. Everything here reads the graph; nothing
    /// mutates it.
    fn prepare(
        &mut self,
        graph: &Graph,
        id: &str,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> EngineResult<Prepared> {
        let node = graph.require(id)?;
        let ty = node.node_type().clone();

        // An up-to-date node is its own cache entry.
        if !node.dirty() {
            if let Some(result) = node.result() {
                return Ok(Prepared::Hit(result.clone()));
            }
        }

        for spec in ty.params() {
            let value = node.param(&spec.name).unwrap_or(&spec.default);
            if let Err(reason) = spec.check(value) {
                return Ok(Prepared::Invalid(EvalError::validation(&spec.name, reason)));
            }
        }
        for name in node.params().keys() {
            if ty.param(name).is_none() {
                return Ok(Prepared::Invalid(EvalError::validation(
                    name,
                    "not declared by the node type",
                )));
            }
        }

        let mut resolved: BTreeMap<String, Value> = BTreeMap::new();
        let mut feeds: Vec<(String, String, u64)> = Vec::new();
        for socket in ty.inputs() {
            match graph.input_binding(id, &socket.name) {
                Some((source_id, source_socket)) => {
                    let source = graph.require(&source_id)?;
                    let value = source
                        .result()
                        .and_then(|result| result.output(&source_socket).cloned());
                    let fingerprint = source.result().map(|result| result.fingerprint());
                    match (value, fingerprint) {
                        (Some(value), Some(fingerprint)) => {
                            resolved.insert(socket.name.clone(), value);
                            feeds.push((socket.name.clone(), source_socket, fingerprint));
                        }
                        _ => {
                            return Ok(Prepared::Invalid(EvalError::missing_input(&socket.name)))
                        }
                    }
                }
                None if socket.required => {
                    return Ok(Prepared::Invalid(EvalError::missing_input(&socket.name)))
                }
                None => {}
            }
        }
        feeds.sort();

        let key = if ty.cacheable() {
            Some(CacheKey::compute(ty.id(), node.params(), &feeds))
        } else {
            None
        };
        if let Some(key) = &key {
            if let Some(result) = self.cache.lookup(key) {
                return Ok(Prepared::Hit(result));
            }
        }

        let ctx = KernelCtx::new(id, self.bridge.clone(), timeout, cancel.clone());
        let inputs = ResolvedInputs::new(resolved);
        let params = node.params().clone();
        let eval = ty.eval();
        let node_id: NodeId = id.to_string();
        let future = async move {
            let result = eval.evaluate(&ctx, &inputs, &params).await;
            (node_id, result)
        }
        .boxed();
        Ok(Prepared::Fresh(key, future))
    }

    /// Apply one completed evaluation on the orchestrating task.
    fn finish(
        &mut self,
        graph: &mut Graph,
        run_id: &str,
        id: &NodeId,
        result: Result<BTreeMap<String, Value>, EvalError>,
        key: Option<CacheKey>,
        slots: &mut HashMap<NodeId, Slot>,
        stats: &mut RunStats,
    ) -> EngineResult<()> {
        match result {
            Ok(outputs) => {
                let ty = graph.require(id)?.node_type().clone();
                if let Some(socket) = ty
                    .outputs()
                    .iter()
                    .find(|socket| !outputs.contains_key(&socket.name))
                {
                    let err = EvalError::contract(format!(
                        "evaluation produced no value for output socket '{}'",
                        socket.name
                    ));
                    warn!(run_id = %run_id, node_id = %id, error = %err, "discarding incomplete result");
                    self.record_failure(run_id, id, err, slots, stats);
                    return Ok(());
                }

                let result = Arc::new(NodeResult::new(outputs));
                if let Some(key) = key {
                    self.cache.insert(key, result.clone());
                }
                let changed = graph.adopt_result(id, result)?;
                slots.insert(
                    id.clone(),
                    Slot::Done(NodeOutcome::Computed { cached: false }),
                );
                debug!(run_id = %run_id, node_id = %id, changed, "node computed");
                self.events.emit(EngineEvent::NodeCompleted {
                    run_id: run_id.to_string(),
                    node_id: id.clone(),
                    cached: false,
                });
            }
            Err(EvalError::Cancelled) => {
                self.record_skip(run_id, id, SkipReason::Cancelled, slots, stats);
            }
            Err(err) => {
                warn!(run_id = %run_id, node_id = %id, error = %err, category = err.category(), "node failed");
                self.record_failure(run_id, id, err, slots, stats);
            }
        }
        Ok(())
    }

    fn record_skip(
        &self,
        run_id: &str,
        id: &str,
        reason: SkipReason,
        slots: &mut HashMap<NodeId, Slot>,
        stats: &mut RunStats,
    ) {
        debug!(run_id = %run_id, node_id = %id, reason = %reason, "node skipped");
        self.events.emit(EngineEvent::NodeSkipped {
            run_id: run_id.to_string(),
            node_id: id.to_string(),
            reason: reason.to_string(),
        });
        slots.insert(id.to_string(), Slot::Done(NodeOutcome::Skipped(reason)));
        stats.skipped += 1;
    }

    fn record_failure(
        &self,
        run_id: &str,
        id: &str,
        err: EvalError,
        slots: &mut HashMap<NodeId, Slot>,
        stats: &mut RunStats,
    ) {
        self.events.emit(EngineEvent::NodeFailed {
            run_id: run_id.to_string(),
            node_id: id.to_string(),
            error: err.to_string(),
        });
        slots.insert(id.to_string(), Slot::Done(NodeOutcome::Failed(err)));
        stats.failed += 1;
    }
}
