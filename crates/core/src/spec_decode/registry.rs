//! Strategy registry: StrategyId → backend, with a guaranteed fallback.

use std::collections::HashMap;
use std::sync::Arc;

use crate::request::StrategyId;

use super::error::{ProposerError, Result};
use super::ProposerBackend;

/// Fixed mapping from strategy id to backend.
///
/// Built once per coordinator and read-only afterwards. Iteration follows
/// registration order; the fallback strategy is always registered first.
pub struct StrategyRegistry {
    backends: HashMap<StrategyId, Arc<dyn ProposerBackend>>,
    order: Vec<StrategyId>,
    fallback: StrategyId,
}

impl StrategyRegistry {
    /// Create a registry holding only the fallback strategy.
    pub fn new(fallback: impl Into<StrategyId>, backend: Arc<dyn ProposerBackend>) -> Self {
        let fallback = fallback.into();
        let mut backends = HashMap::new();
        backends.insert(fallback.clone(), backend);
        Self {
            backends,
            order: vec![fallback.clone()],
            fallback,
        }
    }

    /// Add a strategy. Registering an id twice is a configuration error.
    pub fn register(
        &mut self,
        id: impl Into<StrategyId>,
        backend: Arc<dyn ProposerBackend>,
    ) -> Result<()> {
        let id = id.into();
        if self.backends.contains_key(&id) {
            return Err(ProposerError::Config(format!(
                "strategy '{id}' is registered more than once"
            )));
        }
        self.backends.insert(id.clone(), backend);
        self.order.push(id);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(
        mut self,
        id: impl Into<StrategyId>,
        backend: Arc<dyn ProposerBackend>,
    ) -> Result<Self> {
        self.register(id, backend)?;
        Ok(self)
    }

    pub fn fallback(&self) -> &StrategyId {
        &self.fallback
    }

    pub fn fallback_backend(&self) -> &Arc<dyn ProposerBackend> {
        // The fallback is inserted in `new` and entries are never removed.
        &self.backends[&self.fallback]
    }

    pub fn is_fallback(&self, id: &StrategyId) -> bool {
        *id == self.fallback
    }

    pub fn contains(&self, id: &StrategyId) -> bool {
        self.backends.contains_key(id)
    }

    pub fn get(&self, id: &StrategyId) -> Option<&Arc<dyn ProposerBackend>> {
        self.backends.get(id)
    }

    /// Map an assignment to a registered strategy. Absent or unknown
    /// assignments resolve to the fallback.
    pub fn resolve<'a>(&'a self, assignment: Option<&'a StrategyId>) -> &'a StrategyId {
        match assignment {
            Some(id) if self.contains(id) => id,
            _ => &self.fallback,
        }
    }

    /// Backend for a resolved strategy, falling back for unknown ids.
    pub fn backend_for(&self, id: &StrategyId) -> &Arc<dyn ProposerBackend> {
        self.get(id).unwrap_or_else(|| self.fallback_backend())
    }

    /// Strategies in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&StrategyId, &Arc<dyn ProposerBackend>)> {
        self.order.iter().map(|id| (id, &self.backends[id]))
    }

    pub fn ids(&self) -> impl Iterator<Item = &StrategyId> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.order)
            .field("fallback", &self.fallback)
            .finish()
    }
}
