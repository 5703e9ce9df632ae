//! Exchange abstraction for grid trading - enables mocking for tests

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use log::warn;

use super::errors::{GridError, GridResult};
use super::types::{AccountKey, LimitOrderRequest, MarginInfo, MarginMode, Order, StrategyRecord, UserOrderEvent};

/// Live order updates for one account. The stream ending, or yielding an error,
/// means the connection dropped.
pub type OrderEventStream = BoxStream<'static, GridResult<UserOrderEvent>>;

/// Venue operations for one account - can be mocked for testing
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Account this gateway trades for
    fn account(&self) -> AccountKey;

    /// Open the account's order event stream. Subscribing twice is a no-op on the venue.
    async fn subscribe_account_orders(&self) -> GridResult<OrderEventStream>;

    /// Close the account's order event stream
    async fn unsubscribe_account_orders(&self) -> GridResult<()>;

    /// Pull the authoritative order history for the account
    async fn sync_user_orders(&self) -> GridResult<Vec<Order>>;

    /// Place a limit order, returning its client order id
    async fn create_limit_order(&self, order: &LimitOrderRequest) -> GridResult<String>;

    /// Cancel an order by client order id
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> GridResult<()>;

    /// Cancel all orders for a symbol
    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<u32>;

    /// Update leverage and margin mode for a symbol
    async fn update_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> GridResult<()>;

    /// Get current mid price
    async fn get_mid_price(&self, symbol: &str) -> GridResult<f64>;

    /// Get account margin info
    async fn get_margin_info(&self) -> GridResult<MarginInfo>;
}

/// Builds account-bound gateways for one venue
pub trait GatewayProvider: Send + Sync {
    fn connect(&self, record: &StrategyRecord) -> GridResult<Arc<dyn ExchangeGateway>>;
}

/// Gateway providers by venue name
#[derive(Default, Clone)]
pub struct VenueGateways {
    providers: HashMap<String, Arc<dyn GatewayProvider>>,
}

impl VenueGateways {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, venue: impl Into<String>, provider: Arc<dyn GatewayProvider>) {
        self.providers.insert(venue.into(), provider);
    }

    /// Resolve the gateway for a strategy's venue and account
    pub fn gateway_for(&self, record: &StrategyRecord) -> GridResult<Arc<dyn ExchangeGateway>> {
        let provider = self.providers.get(&record.venue).ok_or_else(|| {
            GridError::InvalidConfig(format!("no gateway registered for venue '{}'", record.venue))
        })?;
        provider.connect(record)
    }
}

/// Run a venue call under a deadline. A timed-out call is a failure, never a success.
pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, fut: F) -> GridResult<T>
where
    F: Future<Output = GridResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} exceeded its {}ms deadline", operation, deadline.as_millis());
            Err(GridError::Timeout {
                operation: operation.to_string(),
                after_ms: deadline.as_millis() as u64,
            })
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock gateway for testing the engine without a venue connection.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use tokio::sync::{mpsc, Mutex};

    /// Mock gateway for testing
    pub struct MockGateway {
        account: AccountKey,
        pub placed: Arc<Mutex<Vec<(String, LimitOrderRequest)>>>,
        pub cancelled: Arc<Mutex<Vec<String>>>,
        pub leverage_updates: Arc<Mutex<Vec<(String, u32, MarginMode)>>>,
        pub sync_result: Arc<Mutex<Vec<Order>>>,
        pub mid_price: Arc<Mutex<f64>>,
        pub margin_info: Arc<Mutex<MarginInfo>>,
        pub should_fail: Arc<Mutex<bool>>,
        pub should_fail_sync: Arc<Mutex<bool>>,
        pub should_fail_subscribe: Arc<Mutex<bool>>,
        /// Delay applied to order placement, for deadline tests
        pub order_delay: Arc<Mutex<Option<Duration>>>,
        stream_tx: Arc<Mutex<Option<mpsc::Sender<GridResult<UserOrderEvent>>>>>,
        next_id: AtomicU64,
        pub sync_calls: AtomicUsize,
        pub subscribe_calls: AtomicUsize,
        pub unsubscribe_calls: AtomicUsize,
    }

    impl MockGateway {
        pub fn new(venue: &str, account: &str) -> Self {
            Self {
                account: AccountKey::new(venue, account),
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                leverage_updates: Arc::new(Mutex::new(Vec::new())),
                sync_result: Arc::new(Mutex::new(Vec::new())),
                mid_price: Arc::new(Mutex::new(0.0)),
                margin_info: Arc::new(Mutex::new(MarginInfo {
                    account_value: 1_000_000.0,
                    margin_used: 0.0,
                    available_margin: 1_000_000.0,
                })),
                should_fail: Arc::new(Mutex::new(false)),
                should_fail_sync: Arc::new(Mutex::new(false)),
                should_fail_subscribe: Arc::new(Mutex::new(false)),
                order_delay: Arc::new(Mutex::new(None)),
                stream_tx: Arc::new(Mutex::new(None)),
                next_id: AtomicU64::new(1),
                sync_calls: AtomicUsize::new(0),
                subscribe_calls: AtomicUsize::new(0),
                unsubscribe_calls: AtomicUsize::new(0),
            }
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        pub async fn set_should_fail_sync(&self, fail: bool) {
            *self.should_fail_sync.lock().await = fail;
        }

        pub async fn set_should_fail_subscribe(&self, fail: bool) {
            *self.should_fail_subscribe.lock().await = fail;
        }

        pub async fn set_mid_price(&self, price: f64) {
            *self.mid_price.lock().await = price;
        }

        pub async fn set_order_delay(&self, delay: Option<Duration>) {
            *self.order_delay.lock().await = delay;
        }

        /// Orders placed so far, in placement order
        pub async fn placed_orders(&self) -> Vec<(String, LimitOrderRequest)> {
            self.placed.lock().await.clone()
        }

        /// Push an event onto the currently open stream. Returns false when no stream is open.
        pub async fn push_event(&self, event: UserOrderEvent) -> bool {
            let tx = self.stream_tx.lock().await.clone();
            match tx {
                Some(tx) => tx.send(Ok(event)).await.is_ok(),
                None => false,
            }
        }

        /// Drop the open stream, simulating a venue disconnect
        pub async fn disconnect(&self) {
            self.stream_tx.lock().await.take();
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        fn account(&self) -> AccountKey {
            self.account.clone()
        }

        async fn subscribe_account_orders(&self) -> GridResult<OrderEventStream> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            if *self.should_fail_subscribe.lock().await {
                return Err(GridError::Subscription("Mock subscribe failure".into()));
            }

            let (tx, rx) = mpsc::channel(64);
            *self.stream_tx.lock().await = Some(tx);

            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(stream))
        }

        async fn unsubscribe_account_orders(&self) -> GridResult<()> {
            self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            self.stream_tx.lock().await.take();
            Ok(())
        }

        async fn sync_user_orders(&self) -> GridResult<Vec<Order>> {
            self.sync_calls.fetch_add(1, Ordering::SeqCst);
            if *self.should_fail_sync.lock().await {
                return Err(GridError::Exchange("Mock sync failure".into()));
            }
            Ok(self.sync_result.lock().await.clone())
        }

        async fn create_limit_order(&self, order: &LimitOrderRequest) -> GridResult<String> {
            let delay = *self.order_delay.lock().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if *self.should_fail.lock().await {
                return Err(GridError::Exchange("Mock failure".into()));
            }

            let client_order_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.placed
                .lock()
                .await
                .push((client_order_id.clone(), order.clone()));
            Ok(client_order_id)
        }

        async fn cancel_order(&self, _symbol: &str, client_order_id: &str) -> GridResult<()> {
            self.cancelled.lock().await.push(client_order_id.to_string());
            Ok(())
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> GridResult<u32> {
            let count = self.placed.lock().await.len() as u32;
            self.placed.lock().await.clear();
            Ok(count)
        }

        async fn update_leverage(&self, symbol: &str, leverage: u32, margin_mode: MarginMode) -> GridResult<()> {
            self.leverage_updates
                .lock()
                .await
                .push((symbol.to_string(), leverage, margin_mode));
            Ok(())
        }

        async fn get_mid_price(&self, _symbol: &str) -> GridResult<f64> {
            Ok(*self.mid_price.lock().await)
        }

        async fn get_margin_info(&self) -> GridResult<MarginInfo> {
            Ok(self.margin_info.lock().await.clone())
        }
    }

    /// Hands out one shared mock gateway per account
    #[derive(Default)]
    pub struct MockProvider {
        gateways: std::sync::Mutex<HashMap<AccountKey, Arc<MockGateway>>>,
    }

    impl MockProvider {
        pub fn gateway(&self, key: &AccountKey) -> Arc<MockGateway> {
            let mut gateways = self.gateways.lock().unwrap_or_else(|e| e.into_inner());
            gateways
                .entry(key.clone())
                .or_insert_with(|| Arc::new(MockGateway::new(&key.venue, &key.account)))
                .clone()
        }
    }

    impl GatewayProvider for MockProvider {
        fn connect(&self, record: &StrategyRecord) -> GridResult<Arc<dyn ExchangeGateway>> {
            Ok(self.gateway(&record.account_key()))
        }
    }
}
