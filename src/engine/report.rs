//! Per-run reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::EvalError;
use crate::graph::node::NodeId;

/// Why a node was skipped instead of evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// A direct upstream ended the run Failed or Skipped.
    UpstreamFailed { node: NodeId },
    /// The run's cancel signal fired before this node completed.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UpstreamFailed { node } => {
                write!(f, "upstream node '{node}' did not complete")
            }
            SkipReason::Cancelled => write!(f, "run cancelled"),
        }
    }
}

/// Terminal state of one scheduled node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node holds a trustworthy result, either freshly computed or
    /// adopted from the cache.
    Computed { cached: bool },
    Failed(EvalError),
    Skipped(SkipReason),
}

impl NodeOutcome {
    pub fn is_computed(&self) -> bool {
        matches!(self, NodeOutcome::Computed { .. })
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, NodeOutcome::Computed { cached: true })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NodeOutcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, NodeOutcome::Skipped(_))
    }

    pub fn error(&self) -> Option<&EvalError> {
        match self {
            NodeOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Nodes in the resolved evaluation plan.
    pub scheduled: usize,
    /// Nodes launched for fresh evaluation (cache misses and exempt types).
    pub dispatched: usize,
    /// Nodes satisfied without evaluation: an up-to-date stored result or a
    /// cache entry.
    pub cache_hits: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunStats {
    pub fn computed(&self) -> usize {
        self.scheduled - self.failed - self.skipped
    }
}

/// Everything a caller learns from one `evaluate` call.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub run_id: String,
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl EvaluationReport {
    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(id)
    }

    pub fn is_computed(&self, id: &str) -> bool {
        self.outcome(id).map(NodeOutcome::is_computed).unwrap_or(false)
    }

    /// True when every scheduled node computed and the run ran to the end.
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.stats.failed == 0 && self.stats.skipped == 0
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}
