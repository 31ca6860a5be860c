//! Template registry

use crate::vm::interpreter::{CallChain, Method};
use crate::vm::types::{Composition, CompositionId, TypeRegistry};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Method tables keyed by composition
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    methods: DashMap<CompositionId, FxHashMap<Arc<str>, Arc<Method>>>,
}

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the native templates of the standard
    /// compositions installed
    pub fn with_builtins(types: &TypeRegistry) -> Self {
        let registry = Self::new();
        super::future::install(&registry, types);
        registry
    }

    /// Register `method` on `composition`, replacing any previous one with
    /// the same name
    pub fn register(&self, composition: &Composition, method: Method) -> Arc<Method> {
        let method = Arc::new(method.with_owner(composition.clone()));
        let name: Arc<str> = Arc::from(method.name());
        self.methods
            .entry(composition.id())
            .or_default()
            .insert(name, method.clone());
        method
    }

    /// Method declared directly on `composition`
    pub fn get(&self, composition: CompositionId, name: &str) -> Option<Arc<Method>> {
        self.methods.get(&composition)?.get(name).cloned()
    }

    /// All implementations of `name` along the lineage of `composition`,
    /// most derived first
    pub fn resolve_chain(&self, composition: &Composition, name: &str) -> Option<CallChain> {
        let methods: Vec<Arc<Method>> = composition
            .lineage()
            .filter_map(|c| self.get(c.id(), name))
            .collect();
        CallChain::new(methods).ok()
    }

    /// Number of compositions with at least one method
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::interpreter::ControlSignal;

    fn noop(name: &str) -> Method {
        Method::native(name, 0, |_, _| Ok(ControlSignal::Next))
    }

    #[test]
    fn test_chain_is_most_derived_first() {
        let types = TypeRegistry::new();
        let base = types.register("Base", None, 0).unwrap();
        let derived = types.register("Derived", Some(base.id()), 0).unwrap();
        let templates = TemplateRegistry::new();
        let on_base = templates.register(&base, noop("run"));
        let on_derived = templates.register(&derived, noop("run"));

        let chain = templates.resolve_chain(&derived, "run").unwrap();
        assert_eq!(chain.len(), 2);
        assert!(Arc::ptr_eq(chain.top(), &on_derived));
        assert!(Arc::ptr_eq(chain.super_chain().unwrap().top(), &on_base));
        assert_eq!(chain.top().owner(), Some(&derived));

        let inherited = templates.resolve_chain(&derived, "run").unwrap();
        assert_eq!(inherited.depth(), 0);
        assert!(templates.resolve_chain(&derived, "missing").is_none());
    }

    #[test]
    fn test_builtin_future_templates() {
        let types = TypeRegistry::new();
        let templates = TemplateRegistry::with_builtins(&types);
        let future = &types.builtins().future;
        for name in ["whenComplete", "thenDo", "passTo", "get", "set", "completeExceptionally"] {
            assert!(templates.get(future.id(), name).is_some(), "missing {}", name);
        }
        assert!(templates.get(types.builtins().reference.id(), "get").is_some());
    }
}
