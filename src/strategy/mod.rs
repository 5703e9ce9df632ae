//! Strategy Interface Module
//!
//! Strategies are the per-instance trading logic the engine drives. The engine only
//! relies on three capabilities: read the configuration, swap it on a live edit,
//! and react to order changes on the strategy's account.
//!
//! # Design Philosophy
//!
//! - **Narrow**: the engine never looks inside a strategy
//! - **Open**: new kinds plug in through a [`StrategyFactory`] registered by name
//! - **Shared**: strategies are `Send + Sync` and held behind `Arc`, so the engine
//!   can call them without holding its own registry lock
//!
//! # Usage with the Engine
//!
//! ```ignore
//! let registry = StrategyRegistry::default();
//! let strategy = registry.create_strategy(GRID_KIND, record, ctx)?;
//! engine.start_strategy(strategy, gateway).await?;
//! ```

pub mod grid;
pub mod registry;
mod traits;

pub use grid::{GridStrategy, GridStrategyFactory};
pub use registry::{StrategyContext, StrategyFactory, StrategyRegistry, GRID_KIND};
pub use traits::Strategy;
