//! Node type registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::types::NodeType;
use crate::error::{EngineError, EngineResult};

/// Catalogs register themselves here at link time; `with_builtins` runs
/// every hook against a fresh registry.
#[linkme::distributed_slice]
pub static NODE_TYPES: [fn(&NodeTypeRegistry)] = [..];

/// Shared map of node type id to definition.
///
/// Clone-cheap; all clones see the same registrations. Registering an id
/// twice replaces the earlier definition, which lets applications shadow a
/// builtin.
#[derive(Debug, Clone)]
pub struct NodeTypeRegistry {
    types: Arc<RwLock<HashMap<String, Arc<NodeType>>>>,
}

impl NodeTypeRegistry {
    /// Empty registry with no types at all.
    pub fn new() -> Self {
        Self {
            types: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry preloaded by every linked catalog hook.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for register in NODE_TYPES {
            register(&registry);
        }
        registry
    }

    pub fn register(&self, node_type: NodeType) {
        let mut types = self.types.write();
        types.insert(node_type.id().to_string(), Arc::new(node_type));
    }

    pub fn get(&self, type_id: &str) -> Option<Arc<NodeType>> {
        self.types.read().get(type_id).cloned()
    }

    /// Resolve a type id or fail with `TypeNotRegistered`.
    pub fn resolve(&self, type_id: &str) -> EngineResult<Arc<NodeType>> {
        self.get(type_id)
            .ok_or_else(|| EngineError::type_not_registered(type_id))
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.types.read().contains_key(type_id)
    }

    /// Registered type ids in sorted order.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.types.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::{NodeEval, ResolvedInputs};
    use crate::error::EvalError;
    use crate::kernel::bridge::KernelCtx;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;

    struct Nop;

    #[async_trait]
    impl NodeEval for Nop {
        async fn evaluate(
            &self,
            _ctx: &KernelCtx,
            _inputs: &ResolvedInputs,
            _params: &BTreeMap<String, Value>,
        ) -> Result<BTreeMap<String, Value>, EvalError> {
            Ok(BTreeMap::new())
        }
    }

    #[test]
    fn resolve_fails_for_unknown_types() {
        let registry = NodeTypeRegistry::new();
        assert!(registry.is_empty());
        match registry.resolve("nope::missing") {
            Err(EngineError::TypeNotRegistered { type_id }) => {
                assert_eq!(type_id, "nope::missing")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn clones_share_registrations() {
        let registry = NodeTypeRegistry::new();
        let view = registry.clone();
        registry.register(NodeType::new("test::a", Nop));
        assert!(view.contains("test::a"));
        assert_eq!(view.list(), vec!["test::a".to_string()]);
    }

    #[test]
    fn builtins_arrive_through_the_linkme_slice() {
        let registry = NodeTypeRegistry::with_builtins();
        assert!(registry.contains("solid::box"));
        assert!(registry.contains("value::constant"));
    }
}
