//! Strategy trait definition

use async_trait::async_trait;

use crate::grid::{GridResult, StrategyRecord};

/// A running strategy as seen by the engine
///
/// The engine knows nothing about how a strategy trades. It only reads the current
/// configuration, swaps it on live edits and tells the strategy that orders on its
/// account changed. Everything else (ladders, counter orders, bookkeeping) is the
/// strategy's business.
///
/// # Lifecycle
///
/// 1. The host builds the strategy through a [`StrategyFactory`](super::StrategyFactory)
/// 2. `StrategyEngine::start_strategy` registers it under its account
/// 3. Each order batch for that account ends in `on_orders_changed`
/// 4. A failed call is retried by the engine after a fixed delay
///
/// # Example Implementation
///
/// ```ignore
/// struct Watcher {
///     record: std::sync::RwLock<StrategyRecord>,
/// }
///
/// #[async_trait]
/// impl Strategy for Watcher {
///     fn get(&self) -> StrategyRecord {
///         self.record.read().unwrap().clone()
///     }
///
///     fn update(&self, record: StrategyRecord) -> GridResult<()> {
///         *self.record.write().unwrap() = record;
///         Ok(())
///     }
///
///     async fn on_orders_changed(&self) -> GridResult<()> {
///         log::info!("orders changed for {}", self.get().id);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Current configuration
    fn get(&self) -> StrategyRecord;

    /// Replace the configuration of the running strategy.
    ///
    /// Implementations reject edits to fields that cannot change while running.
    fn update(&self, record: StrategyRecord) -> GridResult<()>;

    /// Called after an order batch for the strategy's account was persisted
    async fn on_orders_changed(&self) -> GridResult<()>;
}
