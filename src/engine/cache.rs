//! Content-addressed result cache.
//!
//! Keys capture everything that determines a node's outputs: the node type,
//! the canonical parameter bag, and the fingerprints of the upstream
//! results feeding each input socket. Node identity is deliberately absent,
//! so reverting an upstream parameter brings back downstream hits, and two
//! nodes configured identically share one entry.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde_json::Value;
use tracing::trace;

use crate::graph::node::{hash_value, NodeResult};

/// Identity of one memoizable evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    type_id: String,
    state_hash: u64,
}

impl CacheKey {
    /// Build a key from the evaluation state. `feeds` lists each bound
    /// input as (input socket, source socket, upstream fingerprint) and
    /// must be sorted by input socket, which the evaluator's resolved-input
    /// walk already guarantees.
    pub fn compute(
        type_id: &str,
        params: &BTreeMap<String, Value>,
        feeds: &[(String, String, u64)],
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        params.len().hash(&mut hasher);
        for (name, value) in params {
            name.hash(&mut hasher);
            hash_value(value, &mut hasher);
        }
        feeds.len().hash(&mut hasher);
        for (input_socket, source_socket, fingerprint) in feeds {
            input_socket.hash(&mut hasher);
            source_socket.hash(&mut hasher);
            fingerprint.hash(&mut hasher);
        }
        Self {
            type_id: type_id.to_string(),
            state_hash: hasher.finish(),
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }
}

/// Counters describing cache effectiveness for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded LRU store of evaluation results.
pub struct ResultCache {
    entries: LruCache<CacheKey, Arc<NodeResult>>,
    stats: CacheStats,
}

impl ResultCache {
    /// A zero capacity is clamped to one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Fetch an entry, refreshing its recency.
    pub fn lookup(&mut self, key: &CacheKey) -> Option<Arc<NodeResult>> {
        match self.entries.get(key) {
            Some(result) => {
                self.stats.hits += 1;
                trace!(type_id = key.type_id(), "cache hit");
                Some(result.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Store an entry, evicting the least recently used one when full.
    pub fn insert(&mut self, key: CacheKey, result: Arc<NodeResult>) {
        self.stats.insertions += 1;
        if let Some((displaced, _)) = self.entries.push(key.clone(), result) {
            if displaced != key {
                self.stats.evictions += 1;
                trace!(type_id = displaced.type_id(), "evicted cache entry");
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
