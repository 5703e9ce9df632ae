//! Core data types for grid trading

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque strategy identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(pub Uuid);

impl StrategyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StrategyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trading account on one venue. Order event subscriptions are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub venue: String,
    pub account: String,
}

impl AccountKey {
    pub fn new(venue: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            account: account.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.venue, self.account)
    }
}

/// Position direction a grid trades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Buy to open, sell (reduce-only) to close
    Long,
    /// Sell to open, buy (reduce-only) to close
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Cross,
    Isolated,
}

/// How the ladder is distributed across the price range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuantityMode {
    /// Uniform price step between levels
    #[default]
    Arithmetic,
    /// Constant ratio between consecutive levels
    Geometric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Active,
    #[default]
    Inactive,
}

/// One configured grid instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    #[serde(default)]
    pub id: StrategyId,
    /// Owning user
    pub owner: String,
    /// Display label, editable while the strategy runs
    #[serde(default)]
    pub name: String,
    pub venue: String,
    pub symbol: String,
    pub account: String,
    pub direction: Direction,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default)]
    pub quantity_mode: QuantityMode,
    pub lower_price: f64,
    pub upper_price: f64,
    pub grid_count: u32,
    pub leverage: u32,
    /// Base size of the order resting at each level
    pub order_size: f64,
    #[serde(default)]
    pub status: StrategyStatus,
}

impl StrategyRecord {
    pub fn account_key(&self) -> AccountKey {
        AccountKey::new(&self.venue, &self.account)
    }
}

/// One rung of a strategy's ladder. Order references hold client order ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub strategy_id: StrategyId,
    /// Index of this level (0 = lowest price)
    pub index: u32,
    pub price: f64,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy_order: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell_order: Option<String>,
}

impl GridLevel {
    pub fn new(strategy_id: StrategyId, index: u32, price: f64, quantity: f64) -> Self {
        Self {
            strategy_id,
            index,
            price,
            quantity,
            buy_order: None,
            sell_order: None,
        }
    }

    pub fn order_ref(&self, side: OrderSide) -> Option<&str> {
        match side {
            OrderSide::Buy => self.buy_order.as_deref(),
            OrderSide::Sell => self.sell_order.as_deref(),
        }
    }

    /// Check if this level has no outstanding order reference
    pub fn is_empty(&self) -> bool {
        self.buy_order.is_none() && self.sell_order.is_none()
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn is_ask(&self) -> bool {
        matches!(self, OrderSide::Sell)
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Normalized order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Canceled,
}

impl OrderStatus {
    /// Map a venue-specific status string onto the four normalized statuses.
    /// Unknown in-flight variants are treated as pending.
    pub fn normalize(raw: &str) -> Self {
        match raw.to_ascii_lowercase().replace('-', "_").as_str() {
            "open" | "new" | "resting" | "partially_filled" | "partial" | "live" => {
                OrderStatus::Open
            }
            "filled" | "closed" => OrderStatus::Filled,
            "canceled" | "cancelled" | "expired" | "rejected" | "canceled_post_only"
            | "canceled_reduce_only" | "margin_canceled" => OrderStatus::Canceled,
            _ => OrderStatus::Pending,
        }
    }

    /// Active orders can still trade
    pub fn is_active(&self) -> bool {
        !matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }
}

/// Last-known venue truth for one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub venue: String,
    pub account: String,
    pub symbol: String,
    /// Venue-assigned order id
    pub order_id: String,
    pub client_order_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub base_size: f64,
    pub filled_base: f64,
    pub filled_quote: f64,
    pub status: OrderStatus,
    /// Event timestamp in milliseconds
    pub timestamp: u64,
}

/// One filled side of a matched trade pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub client_order_id: String,
    pub filled_base: f64,
    pub filled_quote: f64,
    /// Fill time in milliseconds
    pub filled_at: u64,
}

impl TradeLeg {
    pub fn filled(order: &Order) -> Self {
        Self {
            client_order_id: order.client_order_id.clone(),
            filled_base: order.filled_base,
            filled_quote: order.filled_quote,
            filled_at: order.timestamp,
        }
    }
}

/// Pairs one buy fill with one sell fill for realized-profit accounting.
///
/// A pair opens with one side filled; the other side stays empty until the
/// counter order named by `pending_client_order_id` fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedTradePair {
    pub strategy_id: StrategyId,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buy: Option<TradeLeg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sell: Option<TradeLeg>,
    /// Counter order expected to fill the empty side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_client_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_profit: Option<f64>,
}

impl MatchedTradePair {
    pub fn new(strategy_id: StrategyId, symbol: impl Into<String>) -> Self {
        Self {
            strategy_id,
            symbol: symbol.into(),
            buy: None,
            sell: None,
            pending_client_order_id: None,
            realized_profit: None,
        }
    }

    /// Open a pair from its first fill, waiting on `counter_order` for the other side
    pub fn open(
        strategy_id: StrategyId,
        symbol: impl Into<String>,
        side: OrderSide,
        leg: TradeLeg,
        counter_order: impl Into<String>,
    ) -> Self {
        let mut pair = Self::new(strategy_id, symbol);
        pair.set_leg(side, leg);
        pair.pending_client_order_id = Some(counter_order.into());
        pair
    }

    /// Whether `client_order_id` is this pair's `side` order, filled or pending
    pub fn carries(&self, side: OrderSide, client_order_id: &str) -> bool {
        match self.leg(side) {
            Some(leg) => leg.client_order_id == client_order_id,
            None => self.pending_client_order_id.as_deref() == Some(client_order_id),
        }
    }

    /// Every client order id this pair refers to
    pub fn client_order_ids(&self) -> impl Iterator<Item = &str> {
        self.buy
            .iter()
            .chain(self.sell.iter())
            .map(|leg| leg.client_order_id.as_str())
            .chain(self.pending_client_order_id.as_deref())
    }

    pub fn leg(&self, side: OrderSide) -> Option<&TradeLeg> {
        match side {
            OrderSide::Buy => self.buy.as_ref(),
            OrderSide::Sell => self.sell.as_ref(),
        }
    }

    pub fn set_leg(&mut self, side: OrderSide, leg: TradeLeg) {
        if self.pending_client_order_id.as_deref() == Some(leg.client_order_id.as_str()) {
            self.pending_client_order_id = None;
        }
        match side {
            OrderSide::Buy => self.buy = Some(leg),
            OrderSide::Sell => self.sell = Some(leg),
        }
        self.settle();
    }

    /// Both sides filled
    pub fn is_complete(&self) -> bool {
        self.buy.is_some() && self.sell.is_some()
    }

    fn settle(&mut self) {
        if let (Some(buy), Some(sell)) = (&self.buy, &self.sell) {
            self.realized_profit = Some(sell.filled_quote - buy.filled_quote);
        }
    }
}

/// Batch of order updates for one account, consumed once by the reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct UserOrderEvent {
    pub venue: String,
    pub account: String,
    pub orders: Vec<Order>,
    pub is_snapshot: bool,
}

impl UserOrderEvent {
    pub fn account_key(&self) -> AccountKey {
        AccountKey::new(&self.venue, &self.account)
    }
}

/// Request to place a limit order for a grid level
#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrderRequest {
    /// Level index this order belongs to
    pub level_index: u32,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub reduce_only: bool,
}

impl LimitOrderRequest {
    pub fn new(level_index: u32, symbol: impl Into<String>, side: OrderSide, price: f64, size: f64) -> Self {
        Self {
            level_index,
            symbol: symbol.into(),
            side,
            price,
            size,
            reduce_only: false,
        }
    }

    /// Set reduce_only flag
    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }
}

/// Margin information for start-time checks
#[derive(Debug, Clone, Default)]
pub struct MarginInfo {
    pub account_value: f64,
    pub margin_used: f64,
    pub available_margin: f64,
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
