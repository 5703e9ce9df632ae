//! Strategy engine - routes account order events to running strategies
//!
//! One control loop per engine serializes everything that touches strategy state:
//! order batches from every subscribed account, due retries on each tick, and the
//! shutdown signal. Subscriptions run as their own tasks and only feed the loop
//! through a bounded queue.
//!
//! The registry (running strategies, account index, retry heap and subscription
//! handles) lives behind a single mutex that is never held across a venue or
//! store call.

pub mod lifecycle;
pub mod reconcile;
pub mod retry;
pub mod subscription;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::grid::{
    AccountKey, ExchangeGateway, GridError, GridResult, GridStore, StrategyId, StrategyRecord,
    UserOrderEvent,
};
use crate::strategy::Strategy;

pub use lifecycle::{default_unexpected_cancel_handler, halt_strategy, launch_strategy, resume_strategy};
pub use reconcile::OrderReconciler;
pub use retry::{RetryItem, RetryScheduler};
pub use subscription::{AccountSubscription, Backoff, ConnectionState};

/// Engine timing and queue settings
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Period of the retry drain tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Delay before a failed strategy runs again
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Deadline for every venue call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
    /// How long a placed order counts as in flight without an event confirming it
    #[serde(default = "default_recent_order_ttl_secs")]
    pub recent_order_ttl_secs: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_retry_delay_secs() -> u64 {
    15
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_reconnect_initial_backoff_ms() -> u64 {
    1000
}

fn default_reconnect_max_backoff_ms() -> u64 {
    30_000
}

fn default_recent_order_ttl_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            retry_delay_secs: default_retry_delay_secs(),
            event_queue_capacity: default_event_queue_capacity(),
            call_timeout_secs: default_call_timeout_secs(),
            reconnect_initial_backoff_ms: default_reconnect_initial_backoff_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff_ms(),
            recent_order_ttl_secs: default_recent_order_ttl_secs(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn recent_order_ttl(&self) -> Duration {
        Duration::from_secs(self.recent_order_ttl_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_backoff_ms),
            Duration::from_millis(self.reconnect_max_backoff_ms),
        )
    }
}

/// Host callback for a strategy that must stop because one of its orders was
/// canceled outside the engine. Runs on its own task.
pub type UnexpectedCancelHandler =
    Arc<dyn Fn(StrategyEngine, StrategyRecord) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
struct RunningStrategy {
    strategy: Arc<dyn Strategy>,
    gateway: Arc<dyn ExchangeGateway>,
}

#[derive(Default)]
struct Registry {
    strategies: HashMap<StrategyId, RunningStrategy>,
    /// Account -> strategy ids, kept sorted
    accounts: HashMap<AccountKey, Vec<StrategyId>>,
    subscriptions: HashMap<AccountKey, AccountSubscription>,
    retries: RetryScheduler,
}

impl Registry {
    /// Running strategies of an account in id order
    fn account_strategies(&self, account: &AccountKey) -> Vec<(StrategyId, RunningStrategy)> {
        self.accounts
            .get(account)
            .into_iter()
            .flatten()
            .filter_map(|id| self.strategies.get(id).map(|s| (*id, s.clone())))
            .collect()
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn GridStore>,
    reconciler: OrderReconciler,
    registry: Mutex<Registry>,
    events_tx: mpsc::Sender<UserOrderEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<UserOrderEvent>>>,
    on_unexpected_cancel: RwLock<Option<UnexpectedCancelHandler>>,
}

/// Orchestrates running strategies. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct StrategyEngine {
    inner: Arc<EngineInner>,
}

impl StrategyEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn GridStore>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let reconciler = OrderReconciler::new(store.clone(), config.call_timeout());
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                reconciler,
                registry: Mutex::new(Registry::default()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                on_unexpected_cancel: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn GridStore> {
        self.inner.store.clone()
    }

    /// Install the handler for unexpected order cancellations
    pub fn set_unexpected_cancel_handler(&self, handler: UnexpectedCancelHandler) {
        *self
            .inner
            .on_unexpected_cancel
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Register a strategy under its account and make sure the account is subscribed.
    ///
    /// A subscription failure is returned as an error, but the strategy stays
    /// registered and the subscription keeps reconnecting in the background.
    pub async fn start_strategy(
        &self,
        strategy: Arc<dyn Strategy>,
        gateway: Arc<dyn ExchangeGateway>,
    ) -> GridResult<()> {
        let record = strategy.get();
        let account = record.account_key();

        let state_rx = {
            let mut registry = self.inner.registry.lock().await;
            if registry.strategies.contains_key(&record.id) {
                return Err(GridError::InvalidState(format!(
                    "strategy {} is already running",
                    record.id
                )));
            }

            registry.strategies.insert(
                record.id,
                RunningStrategy {
                    strategy,
                    gateway: gateway.clone(),
                },
            );
            let ids = registry.accounts.entry(account.clone()).or_default();
            ids.push(record.id);
            ids.sort();

            match registry.subscriptions.get(&account) {
                Some(subscription) => subscription.watch(),
                None => {
                    let subscription = self.spawn_subscription(gateway);
                    let rx = subscription.watch();
                    registry.subscriptions.insert(account.clone(), subscription);
                    rx
                }
            }
        };

        info!(
            "Started strategy {} ({} {} on {})",
            record.id, record.symbol, record.name, account
        );

        subscription::wait_connected(state_rx, self.inner.config.call_timeout())
            .await
            .map_err(|e| {
                warn!("Subscription for {} not established yet: {}", account, e);
                e
            })
    }

    /// Deregister a strategy. The account's subscription is torn down with its
    /// last strategy.
    pub async fn stop_strategy(&self, id: StrategyId) -> GridResult<StrategyRecord> {
        let (record, subscription) = {
            let mut registry = self.inner.registry.lock().await;
            let running = registry
                .strategies
                .remove(&id)
                .ok_or(GridError::StrategyNotFound(id))?;
            registry.retries.cancel(id);

            let record = running.strategy.get();
            let account = record.account_key();
            let last = match registry.accounts.get_mut(&account) {
                Some(ids) => {
                    ids.retain(|s| *s != id);
                    ids.is_empty()
                }
                None => true,
            };

            let subscription = if last {
                registry.accounts.remove(&account);
                registry.subscriptions.remove(&account)
            } else {
                None
            };
            (record, subscription)
        };

        if let Some(subscription) = subscription {
            subscription.stop().await;
        }

        info!("Stopped strategy {} ({})", id, record.account_key());
        Ok(record)
    }

    /// Swap the configuration of a running strategy
    pub async fn update_strategy(&self, record: StrategyRecord) -> GridResult<()> {
        let strategy = {
            let registry = self.inner.registry.lock().await;
            registry
                .strategies
                .get(&record.id)
                .map(|s| s.strategy.clone())
                .ok_or(GridError::StrategyNotFound(record.id))?
        };
        strategy.update(record)
    }

    /// Configuration of every running strategy, in id order
    pub async fn running_strategies(&self) -> Vec<StrategyRecord> {
        let registry = self.inner.registry.lock().await;
        let mut records: Vec<_> = registry
            .strategies
            .values()
            .map(|s| s.strategy.get())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Pending retries, earliest first
    pub async fn pending_retries(&self) -> Vec<RetryItem> {
        let registry = self.inner.registry.lock().await;
        let mut items = registry.retries.items();
        items.sort_by_key(|item| item.due_at);
        items
    }

    /// Gateway a running strategy trades through
    pub async fn gateway_for(&self, id: StrategyId) -> Option<Arc<dyn ExchangeGateway>> {
        let registry = self.inner.registry.lock().await;
        registry.strategies.get(&id).map(|s| s.gateway.clone())
    }

    /// Connection state of an account's subscription
    pub async fn connection_state(&self, account: &AccountKey) -> Option<ConnectionState> {
        let registry = self.inner.registry.lock().await;
        registry.subscriptions.get(account).map(|s| s.state())
    }

    /// Run the control loop until `shutdown` resolves, then stop every subscription.
    ///
    /// The loop finishes the batch or retry drain in progress before it checks
    /// for shutdown again.
    pub async fn run<F>(&self, shutdown: F) -> GridResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut events = self
            .inner
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| GridError::InvalidState("engine loop is already running".into()))?;

        let mut tick = interval(self.inner.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Strategy engine running");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = tick.tick() => {
                    self.drain_retries(Instant::now()).await;
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.process_event(event).await {
                        error!("Order batch failed: {}", e);
                    }
                }
            }
        }

        *self.inner.events_rx.lock().await = Some(events);
        self.shutdown().await;
        Ok(())
    }

    /// Stop every subscription and clear the registry
    pub async fn shutdown(&self) {
        let subscriptions: Vec<AccountSubscription> = {
            let mut registry = self.inner.registry.lock().await;
            registry.strategies.clear();
            registry.accounts.clear();
            registry.retries = RetryScheduler::new();
            registry.subscriptions.drain().map(|(_, s)| s).collect()
        };

        for subscription in subscriptions {
            subscription.stop().await;
        }
        info!("Strategy engine stopped");
    }

    /// Reconcile one order batch and run every strategy on its account.
    ///
    /// A reconciliation failure resubscribes the account once and is returned.
    /// Strategy failures are handled through the retry path.
    pub async fn process_event(&self, event: UserOrderEvent) -> GridResult<()> {
        let account = event.account_key();
        let running = {
            let registry = self.inner.registry.lock().await;
            registry.account_strategies(&account)
        };

        let resync_via: Vec<_> = running
            .iter()
            .map(|(id, s)| (*id, s.gateway.clone()))
            .collect();

        if let Err(e) = self.inner.reconciler.apply(&event, &resync_via).await {
            error!("Reconciliation for {} failed: {}", account, e);
            self.resubscribe(&account).await;
            return Err(e);
        }

        for (id, running) in running {
            self.execute(id, &running.strategy).await;
        }
        Ok(())
    }

    /// Run every retry due at `now`
    pub async fn drain_retries(&self, now: Instant) {
        let due: Vec<(StrategyId, RunningStrategy)> = {
            let mut registry = self.inner.registry.lock().await;
            let items = registry.retries.pop_due(now);
            items
                .into_iter()
                .filter_map(|item| {
                    registry
                        .strategies
                        .get(&item.strategy_id)
                        .map(|s| (item.strategy_id, s.clone()))
                })
                .collect()
        };

        for (id, running) in due {
            info!("Retrying strategy {}", id);
            self.execute(id, &running.strategy).await;
        }
    }

    async fn execute(&self, id: StrategyId, strategy: &Arc<dyn Strategy>) {
        match strategy.on_orders_changed().await {
            Ok(()) => {
                let mut registry = self.inner.registry.lock().await;
                if registry.retries.cancel(id) {
                    debug!("Strategy {} recovered, retry cleared", id);
                }
            }
            Err(e) => {
                let delay = self.inner.config.retry_delay();
                {
                    let mut registry = self.inner.registry.lock().await;
                    if registry.strategies.contains_key(&id) {
                        registry.retries.schedule(id, Instant::now() + delay);
                    }
                }
                warn!("Strategy {} failed: {}; retrying in {:?}", id, e, delay);

                if e.is_unexpected_cancel() {
                    self.notify_unexpected_cancel(strategy.get());
                }
            }
        }
    }

    fn notify_unexpected_cancel(&self, record: StrategyRecord) {
        let handler = self
            .inner
            .on_unexpected_cancel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match handler {
            Some(handler) => {
                tokio::spawn(handler(self.clone(), record));
            }
            None => warn!(
                "Strategy {} hit an unexpected cancellation and no handler is installed",
                record.id
            ),
        }
    }

    /// Tear down and re-establish an account's subscription so the venue
    /// redelivers a fresh snapshot
    async fn resubscribe(&self, account: &AccountKey) {
        let (old, gateway) = {
            let mut registry = self.inner.registry.lock().await;
            let gateway = registry
                .account_strategies(account)
                .first()
                .map(|(_, s)| s.gateway.clone());
            (registry.subscriptions.remove(account), gateway)
        };

        if let Some(old) = old {
            old.stop().await;
        }

        let Some(gateway) = gateway else {
            return;
        };

        let fresh = self.spawn_subscription(gateway);
        let extra = {
            let mut registry = self.inner.registry.lock().await;
            let wanted = registry.accounts.contains_key(account)
                && !registry.subscriptions.contains_key(account);
            if wanted {
                registry.subscriptions.insert(account.clone(), fresh);
                None
            } else {
                Some(fresh)
            }
        };

        match extra {
            // Account was stopped or resubscribed meanwhile
            Some(fresh) => fresh.stop().await,
            None => info!("Resubscribed {}", account),
        }
    }

    fn spawn_subscription(&self, gateway: Arc<dyn ExchangeGateway>) -> AccountSubscription {
        AccountSubscription::spawn(
            gateway,
            self.inner.events_tx.clone(),
            self.inner.config.backoff(),
            self.inner.config.call_timeout(),
        )
    }

    /// Watch an account's connection state
    pub async fn watch_connection(&self, account: &AccountKey) -> Option<watch::Receiver<ConnectionState>> {
        let registry = self.inner.registry.lock().await;
        registry.subscriptions.get(account).map(|s| s.watch())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::grid::config::tests::sample_record;
    use crate::grid::executor::mock::MockGateway;
    use crate::grid::ladder::build_ladder;
    use crate::grid::state::tests::order;
    use crate::grid::{
        MemoryStore, Order, OrderSide, OrderStatus, StoreOp, StoreTransaction, StrategyStatus,
    };
    use crate::strategy::{GridStrategy, StrategyContext};

    pub(crate) fn test_config() -> EngineConfig {
        EngineConfig {
            tick_interval_ms: 10,
            call_timeout_secs: 1,
            ..EngineConfig::default()
        }
    }

    fn grid_strategy(
        record: StrategyRecord,
        store: Arc<MemoryStore>,
        gateway: Arc<MockGateway>,
    ) -> Arc<dyn Strategy> {
        Arc::new(GridStrategy::new(
            record,
            StrategyContext {
                store,
                gateway,
                recent_order_ttl: Duration::from_secs(60),
                call_timeout: Duration::from_secs(1),
            },
        ))
    }

    /// Active strategy with the [100, 110, 120] ladder and a buy "b0" on level 0
    async fn seeded(store: &MemoryStore) -> StrategyRecord {
        let mut record = sample_record();
        record.status = StrategyStatus::Active;
        let mut tx = StoreTransaction::new();
        tx.push(StoreOp::SaveStrategy(record.clone()));
        tx.push(StoreOp::ReplaceGridLevels {
            id: record.id,
            levels: build_ladder(&record),
        });
        tx.set_order_ref(record.id, 0, OrderSide::Buy, Some("b0".into()));
        store.commit(tx).await.unwrap();
        record
    }

    fn batch(orders: Vec<Order>, is_snapshot: bool) -> UserOrderEvent {
        UserOrderEvent {
            venue: "paper".into(),
            account: "acct-1".into(),
            orders,
            is_snapshot,
        }
    }

    #[tokio::test]
    async fn test_one_subscription_per_account() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));

        let first = sample_record();
        let second = sample_record();
        engine
            .start_strategy(grid_strategy(first.clone(), store.clone(), gateway.clone()), gateway.clone())
            .await
            .unwrap();
        engine
            .start_strategy(grid_strategy(second.clone(), store.clone(), gateway.clone()), gateway.clone())
            .await
            .unwrap();
        assert_eq!(gateway.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.running_strategies().await.len(), 2);

        engine.stop_strategy(first.id).await.unwrap();
        assert_eq!(gateway.unsubscribe_calls.load(Ordering::SeqCst), 0);

        engine.stop_strategy(second.id).await.unwrap();
        assert_eq!(gateway.unsubscribe_calls.load(Ordering::SeqCst), 1);
        assert!(engine.connection_state(&first.account_key()).await.is_none());

        assert!(matches!(
            engine.stop_strategy(second.id).await,
            Err(GridError::StrategyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_reports_subscription_failure_but_registers() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));
        gateway.set_should_fail_subscribe(true).await;

        let record = sample_record();
        let result = engine
            .start_strategy(grid_strategy(record.clone(), store, gateway.clone()), gateway)
            .await;

        assert!(matches!(result, Err(GridError::Subscription(_))));
        assert_eq!(engine.running_strategies().await, vec![record.clone()]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_fill_event_rotates_and_failure_schedules_retry() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));
        let record = seeded(&store).await;
        engine
            .start_strategy(grid_strategy(record.clone(), store.clone(), gateway.clone()), gateway.clone())
            .await
            .unwrap();

        // Placement fails: retry is scheduled one delay out
        gateway.set_should_fail(true).await;
        let before = Instant::now();
        engine
            .process_event(batch(vec![order("b0", OrderSide::Buy, OrderStatus::Filled, 2)], false))
            .await
            .unwrap();
        let retries = engine.pending_retries().await;
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].strategy_id, record.id);
        assert!(retries[0].due_at >= before + Duration::from_secs(15));

        // Not due yet
        engine.drain_retries(Instant::now()).await;
        assert!(gateway.placed_orders().await.is_empty());

        gateway.set_should_fail(false).await;
        engine
            .drain_retries(Instant::now() + Duration::from_secs(16))
            .await;
        assert_eq!(gateway.placed_orders().await.len(), 1);
        assert!(engine.pending_retries().await.is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_success_clears_pending_retry() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));
        let record = seeded(&store).await;
        engine
            .start_strategy(grid_strategy(record, store.clone(), gateway.clone()), gateway.clone())
            .await
            .unwrap();

        gateway.set_should_fail(true).await;
        engine
            .process_event(batch(vec![order("b0", OrderSide::Buy, OrderStatus::Filled, 2)], false))
            .await
            .unwrap();
        assert_eq!(engine.pending_retries().await.len(), 1);

        gateway.set_should_fail(false).await;
        engine.process_event(batch(vec![], false)).await.unwrap();
        assert!(engine.pending_retries().await.is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unexpected_cancel_invokes_handler() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));
        let record = seeded(&store).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.set_unexpected_cancel_handler(Arc::new(
            move |_engine: StrategyEngine, record: StrategyRecord| -> BoxFuture<'static, ()> {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(record.id);
                })
            },
        ));

        engine
            .start_strategy(grid_strategy(record.clone(), store.clone(), gateway.clone()), gateway.clone())
            .await
            .unwrap();
        engine
            .process_event(batch(vec![order("b0", OrderSide::Buy, OrderStatus::Canceled, 2)], false))
            .await
            .unwrap();

        let notified = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(notified, Some(record.id));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_snapshot_resubscribes_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));
        let record = sample_record();
        engine
            .start_strategy(grid_strategy(record, store.clone(), gateway.clone()), gateway.clone())
            .await
            .unwrap();

        gateway.set_should_fail_sync(true).await;
        let result = engine
            .process_event(batch(vec![order("c1", OrderSide::Buy, OrderStatus::Open, 1)], true))
            .await;
        assert!(matches!(result, Err(GridError::Reconciliation { .. })));
        assert_eq!(gateway.unsubscribe_calls.load(Ordering::SeqCst), 1);

        let mut state = engine
            .watch_connection(&AccountKey::new("paper", "acct-1"))
            .await
            .unwrap();
        while !state.borrow_and_update().is_connected() {
            state.changed().await.unwrap();
        }
        assert_eq!(gateway.subscribe_calls.load(Ordering::SeqCst), 2);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_loop_processes_events_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));
        let record = seeded(&store).await;
        engine
            .start_strategy(grid_strategy(record, store.clone(), gateway.clone()), gateway.clone())
            .await
            .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let runner = engine.clone();
        let handle = tokio::spawn(async move {
            runner
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        assert!(
            gateway
                .push_event(batch(vec![order("b0", OrderSide::Buy, OrderStatus::Filled, 2)], false))
                .await
        );

        let placed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !gateway.placed_orders().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(placed.is_ok());

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(engine.running_strategies().await.is_empty());
        assert_eq!(gateway.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_strategy_swaps_config() {
        let store = Arc::new(MemoryStore::new());
        let engine = StrategyEngine::new(test_config(), store.clone());
        let gateway = Arc::new(MockGateway::new("paper", "acct-1"));
        let mut record = sample_record();
        record.status = StrategyStatus::Active;
        engine
            .start_strategy(grid_strategy(record.clone(), store, gateway.clone()), gateway)
            .await
            .unwrap();

        record.name = "renamed".into();
        engine.update_strategy(record.clone()).await.unwrap();
        assert_eq!(engine.running_strategies().await[0].name, "renamed");

        record.leverage = 20;
        assert!(engine.update_strategy(record).await.is_err());
        engine.shutdown().await;
    }
}
