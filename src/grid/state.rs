//! Durable store abstraction and an in-memory implementation with JSON snapshots

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::errors::{GridError, GridResult};
use super::types::{
    GridLevel, MatchedTradePair, Order, OrderSide, StrategyId, StrategyRecord, StrategyStatus,
};

/// One step of a store transaction
#[derive(Debug, Clone)]
pub enum StoreOp {
    SaveStrategy(StrategyRecord),
    SetStrategyStatus {
        id: StrategyId,
        status: StrategyStatus,
    },
    /// Replace the whole ladder of a strategy
    ReplaceGridLevels {
        id: StrategyId,
        levels: Vec<GridLevel>,
    },
    DeleteGridLevels(StrategyId),
    /// Set or clear one order reference on a level
    SetOrderRef {
        id: StrategyId,
        level_index: u32,
        side: OrderSide,
        client_order_id: Option<String>,
    },
    UpsertTradePair(MatchedTradePair),
}

/// Ordered list of mutations applied all-or-nothing by [`GridStore::commit`]
#[derive(Debug, Clone, Default)]
pub struct StoreTransaction {
    ops: Vec<StoreOp>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: StoreOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set_order_ref(
        &mut self,
        id: StrategyId,
        level_index: u32,
        side: OrderSide,
        client_order_id: Option<String>,
    ) -> &mut Self {
        self.push(StoreOp::SetOrderRef {
            id,
            level_index,
            side,
            client_order_id,
        })
    }

    pub fn upsert_trade_pair(&mut self, pair: MatchedTradePair) -> &mut Self {
        self.push(StoreOp::UpsertTradePair(pair))
    }

    pub fn set_status(&mut self, id: StrategyId, status: StrategyStatus) -> &mut Self {
        self.push(StoreOp::SetStrategyStatus { id, status })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Tie-break for order upserts: a newer timestamp wins, and a stored `open` order
/// accepts any status change even when the timestamp did not advance.
pub fn should_replace(stored: &Order, incoming: &Order) -> bool {
    incoming.timestamp > stored.timestamp
        || (stored.status == super::types::OrderStatus::Open && incoming.status != stored.status)
}

/// Persistence operations used by the engine
#[async_trait]
pub trait GridStore: Send + Sync {
    async fn get_strategy(&self, id: StrategyId) -> GridResult<Option<StrategyRecord>>;

    async fn strategies_with_status(&self, status: StrategyStatus) -> GridResult<Vec<StrategyRecord>>;

    /// Ladder of a strategy ordered by level ascending
    async fn grid_levels(&self, id: StrategyId) -> GridResult<Vec<GridLevel>>;

    /// Upsert a batch of orders atomically, returning how many records changed
    async fn upsert_orders(&self, orders: &[Order]) -> GridResult<usize>;

    /// Look up orders of one account by client order id
    async fn orders_by_client_ids(
        &self,
        venue: &str,
        account: &str,
        client_order_ids: &[String],
    ) -> GridResult<HashMap<String, Order>>;

    /// Find the trade pair whose `side` order, filled or pending, is `client_order_id`
    async fn trade_pair_by_leg(
        &self,
        id: StrategyId,
        side: OrderSide,
        client_order_id: &str,
    ) -> GridResult<Option<MatchedTradePair>>;

    async fn trade_pairs(&self, id: StrategyId) -> GridResult<Vec<MatchedTradePair>>;

    /// Apply a transaction atomically
    async fn commit(&self, tx: StoreTransaction) -> GridResult<()>;
}

/// Serializable contents of the in-memory store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    strategies: HashMap<StrategyId, StrategyRecord>,
    levels: HashMap<StrategyId, Vec<GridLevel>>,
    /// Orders keyed by `venue|symbol|order_id`
    orders: HashMap<String, Order>,
    trade_pairs: HashMap<StrategyId, Vec<MatchedTradePair>>,
    /// `venue|account|client_order_id` -> order key
    #[serde(skip)]
    client_index: HashMap<String, String>,
}

fn order_slot(order: &Order) -> String {
    format!("{}|{}|{}", order.venue, order.symbol, order.order_id)
}

fn client_slot(venue: &str, account: &str, client_order_id: &str) -> String {
    format!("{}|{}|{}", venue, account, client_order_id)
}

impl StoreData {
    fn rebuild_client_index(&mut self) {
        self.client_index = self
            .orders
            .iter()
            .map(|(slot, o)| {
                (
                    client_slot(&o.venue, &o.account, &o.client_order_id),
                    slot.clone(),
                )
            })
            .collect();
    }

    fn upsert_order(&mut self, order: &Order) -> bool {
        let slot = order_slot(order);
        let replace = match self.orders.get(&slot) {
            Some(stored) => should_replace(stored, order),
            None => true,
        };

        if replace {
            self.client_index.insert(
                client_slot(&order.venue, &order.account, &order.client_order_id),
                slot.clone(),
            );
            self.orders.insert(slot, order.clone());
        }
        replace
    }

    fn apply(&mut self, op: StoreOp) -> GridResult<()> {
        match op {
            StoreOp::SaveStrategy(record) => {
                self.strategies.insert(record.id, record);
            }
            StoreOp::SetStrategyStatus { id, status } => {
                let record = self
                    .strategies
                    .get_mut(&id)
                    .ok_or(GridError::StrategyNotFound(id))?;
                record.status = status;
            }
            StoreOp::ReplaceGridLevels { id, mut levels } => {
                levels.sort_by_key(|l| l.index);
                self.levels.insert(id, levels);
            }
            StoreOp::DeleteGridLevels(id) => {
                self.levels.remove(&id);
            }
            StoreOp::SetOrderRef {
                id,
                level_index,
                side,
                client_order_id,
            } => {
                let level = self
                    .levels
                    .get_mut(&id)
                    .and_then(|levels| levels.iter_mut().find(|l| l.index == level_index))
                    .ok_or(GridError::LevelNotFound(level_index))?;
                match side {
                    OrderSide::Buy => level.buy_order = client_order_id,
                    OrderSide::Sell => level.sell_order = client_order_id,
                }
            }
            StoreOp::UpsertTradePair(pair) => {
                let pairs = self.trade_pairs.entry(pair.strategy_id).or_default();
                let existing = pairs.iter_mut().find(|p| same_pair(p, &pair));
                match existing {
                    Some(slot) => *slot = pair,
                    None => pairs.push(pair),
                }
            }
        }
        Ok(())
    }
}

/// Two pair records describe the same trade when they share any client order id
fn same_pair(a: &MatchedTradePair, b: &MatchedTradePair) -> bool {
    a.client_order_ids()
        .any(|cid| b.client_order_ids().any(|other| other == cid))
}

/// In-memory store. When a snapshot path is set, every committed write is saved
/// atomically (write to temp, then rename) before it becomes visible.
pub struct MemoryStore {
    data: RwLock<StoreData>,
    snapshot_path: Option<PathBuf>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store without persistence
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            snapshot_path: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Load the snapshot at `path` if it exists, otherwise start empty
    pub fn open(path: impl Into<PathBuf>) -> GridResult<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let mut data: StoreData = serde_json::from_str(&content)?;
            data.rebuild_client_index();
            info!(
                "Loaded store snapshot from {:?}: {} strategies, {} orders",
                path,
                data.strategies.len(),
                data.orders.len()
            );
            data
        } else {
            info!("No store snapshot at {:?}, starting empty", path);
            StoreData::default()
        };

        Ok(Self {
            data: RwLock::new(data),
            snapshot_path: Some(path),
            fail_writes: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> GridResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GridError::Store("store rejected write".into()));
        }
        Ok(())
    }

    fn save_snapshot(path: &Path, data: &StoreData) -> GridResult<()> {
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(data)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        debug!("Store snapshot saved to {:?}", path);
        Ok(())
    }

    /// Persist `next` and make it the visible state
    fn publish(&self, current: &mut StoreData, next: StoreData) -> GridResult<()> {
        if let Some(path) = &self.snapshot_path {
            Self::save_snapshot(path, &next)?;
        }
        *current = next;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GridStore for MemoryStore {
    async fn get_strategy(&self, id: StrategyId) -> GridResult<Option<StrategyRecord>> {
        Ok(self.data.read().await.strategies.get(&id).cloned())
    }

    async fn strategies_with_status(&self, status: StrategyStatus) -> GridResult<Vec<StrategyRecord>> {
        let data = self.data.read().await;
        let mut records: Vec<_> = data
            .strategies
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|s| s.id);
        Ok(records)
    }

    async fn grid_levels(&self, id: StrategyId) -> GridResult<Vec<GridLevel>> {
        Ok(self
            .data
            .read()
            .await
            .levels
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_orders(&self, orders: &[Order]) -> GridResult<usize> {
        self.check_writable()?;
        let mut data = self.data.write().await;
        let mut next = data.clone();
        let changed = orders.iter().filter(|o| next.upsert_order(o)).count();
        if changed > 0 {
            self.publish(&mut data, next)?;
        }
        Ok(changed)
    }

    async fn orders_by_client_ids(
        &self,
        venue: &str,
        account: &str,
        client_order_ids: &[String],
    ) -> GridResult<HashMap<String, Order>> {
        let data = self.data.read().await;
        Ok(client_order_ids
            .iter()
            .filter_map(|cid| {
                data.client_index
                    .get(&client_slot(venue, account, cid))
                    .and_then(|slot| data.orders.get(slot))
                    .map(|o| (cid.clone(), o.clone()))
            })
            .collect())
    }

    async fn trade_pair_by_leg(
        &self,
        id: StrategyId,
        side: OrderSide,
        client_order_id: &str,
    ) -> GridResult<Option<MatchedTradePair>> {
        let data = self.data.read().await;
        Ok(data.trade_pairs.get(&id).and_then(|pairs| {
            pairs
                .iter()
                .find(|p| p.carries(side, client_order_id))
                .cloned()
        }))
    }

    async fn trade_pairs(&self, id: StrategyId) -> GridResult<Vec<MatchedTradePair>> {
        Ok(self
            .data
            .read()
            .await
            .trade_pairs
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, tx: StoreTransaction) -> GridResult<()> {
        self.check_writable()?;
        let mut data = self.data.write().await;
        let mut next = data.clone();
        for op in tx.ops {
            next.apply(op)?;
        }
        self.publish(&mut data, next)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::grid::config::tests::sample_record;
    use crate::grid::ladder::build_ladder;
    use crate::grid::types::{OrderStatus, TradeLeg};

    pub(crate) fn order(cid: &str, side: OrderSide, status: OrderStatus, ts: u64) -> Order {
        Order {
            venue: "paper".into(),
            account: "acct-1".into(),
            symbol: "BTC".into(),
            order_id: format!("oid-{}", cid),
            client_order_id: cid.into(),
            side,
            price: 100.0,
            base_size: 1.0,
            filled_base: if status == OrderStatus::Filled { 1.0 } else { 0.0 },
            filled_quote: if status == OrderStatus::Filled { 100.0 } else { 0.0 },
            status,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let o = order("c1", OrderSide::Buy, OrderStatus::Open, 10);

        assert_eq!(store.upsert_orders(&[o.clone(), o.clone()]).await.unwrap(), 1);
        let once = store
            .orders_by_client_ids("paper", "acct-1", &["c1".to_string()])
            .await
            .unwrap();

        assert_eq!(store.upsert_orders(&[o.clone()]).await.unwrap(), 0);
        let twice = store
            .orders_by_client_ids("paper", "acct-1", &["c1".to_string()])
            .await
            .unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_delta_does_not_regress_terminal_state() {
        let store = MemoryStore::new();
        store
            .upsert_orders(&[order("c1", OrderSide::Buy, OrderStatus::Filled, 20)])
            .await
            .unwrap();
        store
            .upsert_orders(&[order("c1", OrderSide::Buy, OrderStatus::Open, 10)])
            .await
            .unwrap();

        let stored = store
            .orders_by_client_ids("paper", "acct-1", &["c1".to_string()])
            .await
            .unwrap();
        assert_eq!(stored["c1"].status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_open_order_accepts_transition_with_equal_timestamp() {
        let store = MemoryStore::new();
        store
            .upsert_orders(&[order("c1", OrderSide::Buy, OrderStatus::Open, 10)])
            .await
            .unwrap();
        store
            .upsert_orders(&[order("c1", OrderSide::Buy, OrderStatus::Filled, 9)])
            .await
            .unwrap();

        let stored = store
            .orders_by_client_ids("paper", "acct-1", &["c1".to_string()])
            .await
            .unwrap();
        assert_eq!(stored["c1"].status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let record = sample_record();
        let mut tx = StoreTransaction::new();
        tx.push(StoreOp::SaveStrategy(record.clone()));
        tx.push(StoreOp::ReplaceGridLevels {
            id: record.id,
            levels: build_ladder(&record),
        });
        store.commit(tx).await.unwrap();

        // Second op targets a missing level, so the first must not land either
        let mut tx = StoreTransaction::new();
        tx.set_order_ref(record.id, 0, OrderSide::Buy, Some("b0".into()));
        tx.set_order_ref(record.id, 99, OrderSide::Sell, Some("s99".into()));
        assert!(matches!(
            store.commit(tx).await,
            Err(GridError::LevelNotFound(99))
        ));

        let levels = store.grid_levels(record.id).await.unwrap();
        assert!(levels[0].buy_order.is_none());
    }

    #[tokio::test]
    async fn test_trade_pair_lookup_by_either_leg() {
        let store = MemoryStore::new();
        let id = StrategyId::new();
        let buy = TradeLeg::filled(&order("b1", OrderSide::Buy, OrderStatus::Filled, 1));
        let mut pair = MatchedTradePair::open(id, "BTC", OrderSide::Buy, buy, "s1");

        let mut tx = StoreTransaction::new();
        tx.upsert_trade_pair(pair.clone());
        store.commit(tx).await.unwrap();

        // Pending sell is found before it fills
        let found = store
            .trade_pair_by_leg(id, OrderSide::Sell, "s1")
            .await
            .unwrap()
            .unwrap();
        assert!(found.sell.is_none());
        assert!(store
            .trade_pair_by_leg(id, OrderSide::Buy, "b1")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .trade_pair_by_leg(id, OrderSide::Buy, "s1")
            .await
            .unwrap()
            .is_none());

        // Filling the pending side updates the same record
        let mut sell = order("s1", OrderSide::Sell, OrderStatus::Filled, 2);
        sell.filled_quote = 110.0;
        pair.set_leg(OrderSide::Sell, TradeLeg::filled(&sell));
        let mut tx = StoreTransaction::new();
        tx.upsert_trade_pair(pair);
        store.commit(tx).await.unwrap();

        let pairs = store.trade_pairs(id).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].is_complete());
        assert_eq!(pairs[0].pending_client_order_id, None);
        assert_eq!(pairs[0].realized_profit, Some(10.0));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let record = sample_record();
        {
            let store = MemoryStore::open(&path).unwrap();
            let mut tx = StoreTransaction::new();
            tx.push(StoreOp::SaveStrategy(record.clone()));
            store.commit(tx).await.unwrap();
            store
                .upsert_orders(&[order("c1", OrderSide::Buy, OrderStatus::Open, 1)])
                .await
                .unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_strategy(record.id).await.unwrap(),
            Some(record)
        );
        let orders = reopened
            .orders_by_client_ids("paper", "acct-1", &["c1".to_string()])
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_untouched() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store
            .upsert_orders(&[order("c1", OrderSide::Buy, OrderStatus::Open, 1)])
            .await
            .is_err());
        store.set_fail_writes(false);
        let orders = store
            .orders_by_client_ids("paper", "acct-1", &["c1".to_string()])
            .await
            .unwrap();
        assert!(orders.is_empty());
    }
}
