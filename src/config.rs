//! Engine configuration and per-run options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelSignal;
use crate::error::{EngineError, EngineResult};

/// Session-wide tuning for an [`Evaluator`](crate::engine::Evaluator).
///
/// All fields have working defaults; construct with struct-update syntax or
/// take a preset and adjust.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of node evaluations in flight at once. Kernel workers
    /// are single-session, so this also bounds outstanding kernel requests.
    pub concurrency_limit: usize,

    /// Deadline applied to each kernel request unless a run overrides it.
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Upper bound on retained result cache entries. Exceeding it evicts
    /// least-recently-used entries.
    pub cache_capacity: usize,

    /// Buffered capacity of the engine event bus. Overflow drops the oldest
    /// event rather than blocking evaluation.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            default_timeout: Duration::from_secs(30),
            cache_capacity: 1024,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Preset for interactive editing sessions: shorter kernel deadlines so
    /// a stuck operation surfaces quickly.
    pub fn interactive() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Preset for headless batch regeneration: wider kernel deadlines and a
    /// larger cache.
    pub fn batch() -> Self {
        Self {
            concurrency_limit: 8,
            default_timeout: Duration::from_secs(120),
            cache_capacity: 8192,
            event_capacity: 1024,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.concurrency_limit == 0 {
            return Err(EngineError::invalid_config(
                "concurrency_limit must be at least 1",
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(EngineError::invalid_config(
                "default_timeout must be non-zero",
            ));
        }
        if self.cache_capacity == 0 {
            return Err(EngineError::invalid_config(
                "cache_capacity must be at least 1",
            ));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::invalid_config(
                "event_capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Per-run overrides passed to `evaluate`.
///
/// Unset fields fall back to the engine configuration. The cancel signal is
/// always present; callers who never cancel can ignore it.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Override of [`EngineConfig::concurrency_limit`] for this run.
    pub concurrency: Option<usize>,

    /// Override of [`EngineConfig::default_timeout`] for this run.
    pub timeout: Option<Duration>,

    /// Cancellation signal observed between node completions and inside
    /// every kernel dispatch of the run.
    pub cancel: CancelSignal,
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Effective limits for a run under `config`.
    pub(crate) fn resolve(&self, config: &EngineConfig) -> (usize, Duration) {
        let concurrency = self
            .concurrency
            .unwrap_or(config.concurrency_limit)
            .max(1);
        let timeout = self.timeout.unwrap_or(config.default_timeout);
        (concurrency, timeout)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
