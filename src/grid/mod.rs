//! Grid Trading Module
//!
//! Domain core of the grid engine: the data model, venue and store abstractions,
//! and the rebalancing state machine that rotates fills along a static ladder.
//!
//! # Architecture
//!
//! - [`types`] - Core data types (StrategyRecord, GridLevel, Order, MatchedTradePair, ...)
//! - [`errors`] - Grid-specific error types and their failure classes
//! - [`config`] - Strategy validation, margin and live-edit checks
//! - [`ladder`] - Ladder generation (arithmetic or geometric spacing)
//! - [`executor`] - Exchange gateway abstraction (mockable for testing)
//! - [`state`] - Durable store abstraction with an in-memory JSON-snapshot store
//! - [`rebalancer`] - Per-strategy rotation state machine
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use grid_engine::grid::{GridRebalancer, MemoryStore};
//!
//! let store = MemoryStore::open("grid_state.json")?;
//! let mut rebalancer = GridRebalancer::new(record.id, ttl, call_timeout);
//!
//! // After every persisted order batch for the account
//! let outcome = rebalancer.rebalance(&record, &store, gateway.as_ref()).await?;
//! ```
//!
//! # Testing
//!
//! The module provides mock implementations for testing without connecting
//! to a venue:
//!
//! ```rust,ignore
//! use grid_engine::grid::executor::mock::MockGateway;
//!
//! let gateway = MockGateway::new("paper", "acct-1");
//! gateway.set_should_fail(true).await;
//! ```

pub mod config;
pub mod errors;
pub mod executor;
pub mod ladder;
pub mod rebalancer;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use config::MAX_LEVERAGE;
pub use errors::{ErrorKind, GridError, GridResult};
pub use executor::{with_deadline, ExchangeGateway, GatewayProvider, OrderEventStream, VenueGateways};
pub use rebalancer::{GridRebalancer, RebalanceOutcome};
pub use state::{GridStore, MemoryStore, StoreOp, StoreTransaction};
pub use types::{
    now_millis, AccountKey, Direction, GridLevel, LimitOrderRequest, MarginInfo, MarginMode,
    MatchedTradePair, Order, OrderSide, OrderStatus, QuantityMode, StrategyId,
    StrategyRecord, StrategyStatus, TradeLeg, UserOrderEvent,
};
