//! Evaluation: planning, caching, reporting, and the orchestrator.

pub mod cache;
pub mod evaluator;
pub mod events;
pub mod report;
pub mod resolver;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use evaluator::Evaluator;
pub use events::{EngineEvent, EventBus};
pub use report::{EvaluationReport, NodeOutcome, RunStats, SkipReason};
pub use resolver::upstream_order;
