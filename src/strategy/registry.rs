use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::grid::GridStrategyFactory;
use super::Strategy;
use crate::grid::{ExchangeGateway, GridError, GridResult, GridStore, StrategyRecord};

/// Kind name of the grid strategy
pub const GRID_KIND: &str = "grid";

/// Collaborators handed to a strategy when it is built
#[derive(Clone)]
pub struct StrategyContext {
    pub store: Arc<dyn GridStore>,
    /// Gateway bound to the strategy's account
    pub gateway: Arc<dyn ExchangeGateway>,
    /// How long a placed order counts as in flight before the store confirms it
    pub recent_order_ttl: Duration,
    /// Deadline for each venue call
    pub call_timeout: Duration,
}

/// Factory trait for creating strategies
pub trait StrategyFactory: Send + Sync {
    /// Create a new strategy instance for the given record
    fn create(&self, record: StrategyRecord, ctx: StrategyContext) -> GridResult<Arc<dyn Strategy>>;
}

/// Registry for strategy factories
pub struct StrategyRegistry {
    factories: HashMap<String, Box<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a strategy factory
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: StrategyFactory + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Create a strategy by kind
    pub fn create_strategy(
        &self,
        kind: &str,
        record: StrategyRecord,
        ctx: StrategyContext,
    ) -> GridResult<Arc<dyn Strategy>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| GridError::InvalidConfig(format!("unknown strategy kind '{}'", kind)))?;
        factory.create(record, ctx)
    }
}

impl Default for StrategyRegistry {
    /// Registry with every built-in kind
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(GRID_KIND, GridStrategyFactory);
        registry
    }
}
