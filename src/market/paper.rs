//! Paper trading venue
//!
//! Simulates a perpetuals venue locally: resting limit orders fill when the mark
//! price crosses their limit, and every order change is pushed to the owning
//! account's order stream. A (re)subscription always starts with a snapshot of
//! the account's orders, followed by incremental updates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{mpsc, Mutex};

use crate::grid::{
    now_millis, AccountKey, ExchangeGateway, GatewayProvider, GridError, GridResult,
    LimitOrderRequest, MarginInfo, MarginMode, Order, OrderEventStream, OrderSide, OrderStatus,
    StrategyRecord, UserOrderEvent, MAX_LEVERAGE,
};

/// Net position of one account in one symbol
#[derive(Debug, Clone, Default)]
pub struct PaperPosition {
    /// Positive = long, negative = short
    pub size: f64,
    pub entry_price: f64,
    pub realized_pnl: f64,
}

impl PaperPosition {
    fn apply_fill(&mut self, qty: f64, price: f64, side: OrderSide) {
        let signed = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };

        if self.size == 0.0 || self.size.signum() == signed.signum() {
            let notional = self.entry_price * self.size.abs() + price * qty;
            self.size += signed;
            self.entry_price = notional / self.size.abs();
            return;
        }

        let closed = qty.min(self.size.abs());
        self.realized_pnl += if self.size > 0.0 {
            (price - self.entry_price) * closed
        } else {
            (self.entry_price - price) * closed
        };
        self.size += signed;

        if self.size.abs() < f64::EPSILON {
            self.size = 0.0;
            self.entry_price = 0.0;
        } else if qty > closed {
            // Flipped through zero: the remainder opens at the fill price
            self.entry_price = price;
        }
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        (mark - self.entry_price) * self.size
    }
}

#[derive(Default)]
struct PaperAccount {
    /// In placement order
    orders: Vec<Order>,
    positions: HashMap<String, PaperPosition>,
    leverage: HashMap<String, (u32, MarginMode)>,
    feed: Option<mpsc::UnboundedSender<GridResult<UserOrderEvent>>>,
}

impl PaperAccount {
    fn publish(&mut self, key: &AccountKey, orders: Vec<Order>, is_snapshot: bool) {
        let Some(feed) = &self.feed else {
            return;
        };
        let event = UserOrderEvent {
            venue: key.venue.clone(),
            account: key.account.clone(),
            orders,
            is_snapshot,
        };
        if feed.send(Ok(event)).is_err() {
            self.feed = None;
        }
    }
}

struct PaperBook {
    starting_balance: f64,
    prices: HashMap<String, f64>,
    accounts: HashMap<AccountKey, PaperAccount>,
    next_id: u64,
    clock: u64,
}

impl PaperBook {
    /// Strictly increasing event time, so later updates always win reconciliation
    fn tick(&mut self) -> u64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    /// Fill every resting order of `symbol` the mark has crossed, then notify each
    /// affected account once
    fn cross(&mut self, symbol: &str, mark: f64) {
        let now = self.tick();
        for (key, account) in self.accounts.iter_mut() {
            let mut filled = Vec::new();
            for order in account.orders.iter_mut() {
                let crossed = match order.side {
                    OrderSide::Buy => mark <= order.price,
                    OrderSide::Sell => mark >= order.price,
                };
                if order.symbol != symbol || !order.status.is_active() || !crossed {
                    continue;
                }

                order.status = OrderStatus::Filled;
                order.filled_base = order.base_size;
                order.filled_quote = order.base_size * order.price;
                order.timestamp = now;
                account
                    .positions
                    .entry(order.symbol.clone())
                    .or_default()
                    .apply_fill(order.base_size, order.price, order.side);

                info!(
                    "Paper fill on {}: {} {} {} @ {} ({})",
                    key, order.side, order.base_size, order.symbol, order.price, order.client_order_id
                );
                filled.push(order.clone());
            }
            if !filled.is_empty() {
                account.publish(key, filled, false);
            }
        }
    }
}

/// Shared simulated venue. Cheap to clone; clones see the same book.
#[derive(Clone)]
pub struct PaperVenue {
    name: String,
    book: Arc<Mutex<PaperBook>>,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>, starting_balance: f64) -> Self {
        Self {
            name: name.into(),
            book: Arc::new(Mutex::new(PaperBook {
                starting_balance,
                prices: HashMap::new(),
                accounts: HashMap::new(),
                next_id: 1,
                clock: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gateway bound to one account on this venue
    pub fn gateway(&self, account: impl Into<String>) -> PaperGateway {
        PaperGateway {
            key: AccountKey::new(&self.name, account),
            book: self.book.clone(),
        }
    }

    /// Move the mark price and fill whatever it crosses
    pub async fn set_mark_price(&self, symbol: &str, price: f64) {
        let mut book = self.book.lock().await;
        book.prices.insert(symbol.to_string(), price);
        book.cross(symbol, price);
    }

    pub async fn mark_price(&self, symbol: &str) -> Option<f64> {
        self.book.lock().await.prices.get(symbol).copied()
    }

    pub async fn position(&self, account: &str, symbol: &str) -> Option<PaperPosition> {
        let book = self.book.lock().await;
        book.accounts
            .get(&AccountKey::new(&self.name, account))
            .and_then(|a| a.positions.get(symbol).cloned())
    }

    /// Cancel an order as if from outside the engine, e.g. by the venue's risk engine
    pub async fn force_cancel(&self, account: &str, client_order_id: &str) -> bool {
        let key = AccountKey::new(&self.name, account);
        let mut book = self.book.lock().await;
        let now = book.tick();
        let Some(state) = book.accounts.get_mut(&key) else {
            return false;
        };
        let Some(order) = state
            .orders
            .iter_mut()
            .find(|o| o.client_order_id == client_order_id && o.status.is_active())
        else {
            return false;
        };
        order.status = OrderStatus::Canceled;
        order.timestamp = now;
        let order = order.clone();
        state.publish(&key, vec![order], false);
        true
    }

    /// Drop an account's order stream, simulating a lost connection
    pub async fn disconnect(&self, account: &str) {
        let key = AccountKey::new(&self.name, account);
        if let Some(state) = self.book.lock().await.accounts.get_mut(&key) {
            state.feed = None;
        }
    }
}

impl GatewayProvider for PaperVenue {
    fn connect(&self, record: &StrategyRecord) -> GridResult<Arc<dyn ExchangeGateway>> {
        if record.venue != self.name {
            return Err(GridError::InvalidConfig(format!(
                "strategy venue '{}' does not match paper venue '{}'",
                record.venue, self.name
            )));
        }
        Ok(Arc::new(self.gateway(&record.account)))
    }
}

/// Account-bound handle onto a [`PaperVenue`]
pub struct PaperGateway {
    key: AccountKey,
    book: Arc<Mutex<PaperBook>>,
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn account(&self) -> AccountKey {
        self.key.clone()
    }

    async fn subscribe_account_orders(&self) -> GridResult<OrderEventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut book = self.book.lock().await;
        let account = book.accounts.entry(self.key.clone()).or_default();
        account.feed = Some(tx);
        let snapshot = account.orders.clone();
        account.publish(&self.key, snapshot, true);
        debug!("Paper order stream opened for {}", self.key);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn unsubscribe_account_orders(&self) -> GridResult<()> {
        if let Some(account) = self.book.lock().await.accounts.get_mut(&self.key) {
            account.feed = None;
        }
        Ok(())
    }

    async fn sync_user_orders(&self) -> GridResult<Vec<Order>> {
        let book = self.book.lock().await;
        Ok(book
            .accounts
            .get(&self.key)
            .map(|a| a.orders.clone())
            .unwrap_or_default())
    }

    async fn create_limit_order(&self, request: &LimitOrderRequest) -> GridResult<String> {
        if request.size <= 0.0 || request.price <= 0.0 {
            return Err(GridError::Exchange(format!(
                "rejected order: size {} price {}",
                request.size, request.price
            )));
        }

        let mut book = self.book.lock().await;
        let id = book.next_id;
        book.next_id += 1;
        let now = book.tick();
        let mark = book.prices.get(&request.symbol).copied();

        let order = Order {
            venue: self.key.venue.clone(),
            account: self.key.account.clone(),
            symbol: request.symbol.clone(),
            order_id: id.to_string(),
            client_order_id: format!("paper-{}", id),
            side: request.side,
            price: request.price,
            base_size: request.size,
            filled_base: 0.0,
            filled_quote: 0.0,
            status: OrderStatus::Open,
            timestamp: now,
        };
        let client_order_id = order.client_order_id.clone();

        info!(
            "Paper order {} on {}: {} {} {} @ {}{}",
            client_order_id,
            self.key,
            request.side,
            request.size,
            request.symbol,
            request.price,
            if request.reduce_only { " (reduce-only)" } else { "" }
        );

        let account = book.accounts.entry(self.key.clone()).or_default();
        account.orders.push(order.clone());
        account.publish(&self.key, vec![order], false);

        // Marketable on arrival
        if let Some(mark) = mark {
            book.cross(&request.symbol, mark);
        }
        Ok(client_order_id)
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> GridResult<()> {
        let mut book = self.book.lock().await;
        let now = book.tick();
        let account = book
            .accounts
            .get_mut(&self.key)
            .ok_or_else(|| GridError::Exchange(format!("unknown account {}", self.key)))?;
        let order = account
            .orders
            .iter_mut()
            .find(|o| o.symbol == symbol && o.client_order_id == client_order_id)
            .ok_or_else(|| GridError::Exchange(format!("unknown order {}", client_order_id)))?;

        if !order.status.is_active() {
            return Err(GridError::Exchange(format!(
                "order {} is already {:?}",
                client_order_id, order.status
            )));
        }
        order.status = OrderStatus::Canceled;
        order.timestamp = now;
        let order = order.clone();
        account.publish(&self.key, vec![order], false);
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<u32> {
        let mut book = self.book.lock().await;
        let now = book.tick();
        let Some(account) = book.accounts.get_mut(&self.key) else {
            return Ok(0);
        };

        let mut canceled = Vec::new();
        for order in account.orders.iter_mut() {
            if order.symbol == symbol && order.status.is_active() {
                order.status = OrderStatus::Canceled;
                order.timestamp = now;
                canceled.push(order.clone());
            }
        }
        let count = canceled.len() as u32;
        if !canceled.is_empty() {
            account.publish(&self.key, canceled, false);
        }
        Ok(count)
    }

    async fn update_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> GridResult<()> {
        if leverage == 0 || leverage > MAX_LEVERAGE {
            return Err(GridError::Exchange(format!("leverage {} not allowed", leverage)));
        }
        let mut book = self.book.lock().await;
        book.accounts
            .entry(self.key.clone())
            .or_default()
            .leverage
            .insert(symbol.to_string(), (leverage, margin_mode));
        Ok(())
    }

    async fn get_mid_price(&self, symbol: &str) -> GridResult<f64> {
        self.book
            .lock()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| GridError::Exchange(format!("no price for {}", symbol)))
    }

    async fn get_margin_info(&self) -> GridResult<MarginInfo> {
        let book = self.book.lock().await;
        let Some(account) = book.accounts.get(&self.key) else {
            return Ok(MarginInfo {
                account_value: book.starting_balance,
                margin_used: 0.0,
                available_margin: book.starting_balance,
            });
        };

        let mut account_value = book.starting_balance;
        let mut margin_used = 0.0;
        for (symbol, position) in &account.positions {
            let mark = book.prices.get(symbol).copied().unwrap_or(position.entry_price);
            let leverage = account.leverage.get(symbol).map(|(l, _)| *l).unwrap_or(1).max(1);
            account_value += position.realized_pnl + position.unrealized_pnl(mark);
            margin_used += position.size.abs() * mark / leverage as f64;
        }

        Ok(MarginInfo {
            account_value,
            margin_used,
            available_margin: (account_value - margin_used).max(0.0),
        })
    }
}

/// Deterministic oscillating mark for driving a paper venue: a triangle wave of
/// `amplitude` around `base`, one full swing every `period` steps.
pub fn oscillating_price(base: f64, amplitude: f64, step: u64, period: u64) -> f64 {
    let period = period.max(2);
    let phase = (step % period) as f64 / period as f64;
    let wave = if phase < 0.5 {
        4.0 * phase - 1.0
    } else {
        3.0 - 4.0 * phase
    };
    base + amplitude * wave
}
