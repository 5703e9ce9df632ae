//! Grid rebalancer - rotates filled orders to the adjacent level
//!
//! Level state is never stored directly. It is derived on every pass from the
//! level's order references and the current status of the referenced orders:
//!
//! - no reference: empty
//! - reference to an active order (or one the store has not seen yet): awaiting
//! - reference to a filled order: filled, pending rotation
//!
//! A rotation places the counter order first and only then commits the level and
//! trade-pair changes in one transaction, so a failed placement leaves no trace.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::Instant;

use super::errors::{GridError, GridResult};
use super::executor::{with_deadline, ExchangeGateway};
use super::ladder::is_reduce_only;
use super::state::{GridStore, StoreTransaction};
use super::types::{
    Direction, GridLevel, LimitOrderRequest, MatchedTradePair, Order, OrderSide, OrderStatus,
    StrategyId, StrategyRecord, TradeLeg,
};

/// A counter order this rebalancer placed and has not yet seen confirmed by the store
#[derive(Debug, Clone)]
struct Submission {
    client_order_id: String,
    /// Level and side of the fill that triggered the placement
    source_index: u32,
    source_side: OrderSide,
    source_order: String,
    pair: MatchedTradePair,
    submitted_at: Instant,
    /// Whether the level link has been committed
    linked: bool,
}

/// Result of one rebalance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceOutcome {
    /// Counter orders placed
    pub placed: usize,
    /// Earlier placements whose level link was committed late
    pub relinked: usize,
}

/// A filled order found on a level during a pass
struct Fill {
    level_index: u32,
    side: OrderSide,
    order: Order,
}

/// Per-strategy rotation state machine
pub struct GridRebalancer {
    strategy_id: StrategyId,
    /// Keyed by (target level, side of the placed order)
    submissions: HashMap<(u32, OrderSide), Submission>,
    recent_ttl: Duration,
    call_timeout: Duration,
}

impl GridRebalancer {
    pub fn new(strategy_id: StrategyId, recent_ttl: Duration, call_timeout: Duration) -> Self {
        Self {
            strategy_id,
            submissions: HashMap::new(),
            recent_ttl,
            call_timeout,
        }
    }

    /// Placements not yet confirmed by an order event
    pub fn pending_submissions(&self) -> usize {
        self.submissions.len()
    }

    /// Run one rebalance pass over the strategy's ladder.
    ///
    /// Every filled reference is rotated when its neighbour is free. A reference to
    /// a canceled order does not stop the pass; it is reported as
    /// [`GridError::UnexpectedCancel`] once the other fills have been handled.
    pub async fn rebalance(
        &mut self,
        record: &StrategyRecord,
        store: &dyn GridStore,
        gateway: &dyn ExchangeGateway,
    ) -> GridResult<RebalanceOutcome> {
        let mut outcome = RebalanceOutcome::default();

        let mut levels = store.grid_levels(record.id).await?;
        if levels.is_empty() {
            debug!("[{}] No grid levels, nothing to rebalance", record.id);
            return Ok(outcome);
        }

        let orders = self.load_orders(record, store, &levels).await?;

        outcome.relinked = self.relink(store, &mut levels, &orders).await;

        let mut unexpected_cancel = None;
        let mut fills = Vec::new();
        for level in &levels {
            for side in [OrderSide::Buy, OrderSide::Sell] {
                let Some(cid) = level.order_ref(side) else {
                    continue;
                };
                match orders.get(cid).map(|o| o.status) {
                    // Not reported yet: still pending
                    None => {}
                    Some(OrderStatus::Filled) => fills.push(Fill {
                        level_index: level.index,
                        side,
                        order: orders[cid].clone(),
                    }),
                    Some(OrderStatus::Canceled) => {
                        warn!(
                            "[{}] {} order {} at level {} was canceled outside the grid",
                            record.id, side, cid, level.index
                        );
                        unexpected_cancel.get_or_insert_with(|| cid.to_string());
                    }
                    Some(_) => {}
                }
            }
        }

        for fill in fills {
            if self
                .rotate(record, store, gateway, &mut levels, &orders, &fill)
                .await?
            {
                outcome.placed += 1;
            }
        }

        if let Some(client_order_id) = unexpected_cancel {
            return Err(GridError::UnexpectedCancel {
                strategy_id: record.id,
                client_order_id,
            });
        }

        if outcome.placed > 0 || outcome.relinked > 0 {
            info!(
                "[{}] Rebalance pass: placed={}, relinked={}",
                record.id, outcome.placed, outcome.relinked
            );
        }
        Ok(outcome)
    }

    /// Fetch every order referenced by the ladder or by a recent submission
    async fn load_orders(
        &self,
        record: &StrategyRecord,
        store: &dyn GridStore,
        levels: &[GridLevel],
    ) -> GridResult<HashMap<String, Order>> {
        let mut ids: Vec<String> = levels
            .iter()
            .flat_map(|l| [l.buy_order.clone(), l.sell_order.clone()])
            .flatten()
            .collect();
        ids.extend(self.submissions.values().map(|s| s.client_order_id.clone()));
        ids.sort();
        ids.dedup();

        store
            .orders_by_client_ids(&record.venue, &record.account, &ids)
            .await
    }

    /// Commit links that failed after a successful placement, then forget
    /// submissions the store has confirmed or that outlived their TTL.
    async fn relink(
        &mut self,
        store: &dyn GridStore,
        levels: &mut [GridLevel],
        orders: &HashMap<String, Order>,
    ) -> usize {
        let mut relinked = 0;
        let mut keys: Vec<_> = self.submissions.keys().copied().collect();
        keys.sort_by_key(|(index, side)| (*index, side.is_ask()));

        for key in keys {
            let Some(submission) = self.submissions.get(&key) else {
                continue;
            };

            if !submission.linked {
                let (target_index, target_side) = key;
                let tx = link_transaction(self.strategy_id, target_index, target_side, submission);
                match store.commit(tx).await {
                    Ok(()) => {
                        warn!(
                            "[{}] Re-linked orphaned {} order {} to level {}",
                            self.strategy_id, target_side, submission.client_order_id, target_index
                        );
                        apply_link(levels, target_index, target_side, submission);
                        relinked += 1;
                        if let Some(s) = self.submissions.get_mut(&key) {
                            s.linked = true;
                        }
                    }
                    Err(e) => {
                        error!(
                            "[{}] Still unable to link order {} to level {}: {}",
                            self.strategy_id, submission.client_order_id, target_index, e
                        );
                        continue;
                    }
                }
            }

            let Some(submission) = self.submissions.get(&key) else {
                continue;
            };
            if orders.contains_key(&submission.client_order_id) {
                self.submissions.remove(&key);
            } else if submission.submitted_at.elapsed() > self.recent_ttl {
                debug!(
                    "[{}] Order {} not confirmed within {:?}",
                    self.strategy_id, submission.client_order_id, self.recent_ttl
                );
                self.submissions.remove(&key);
            }
        }
        relinked
    }

    /// Whether `target` may receive a new `side` order
    fn is_free(&self, target: &GridLevel, side: OrderSide, orders: &HashMap<String, Order>) -> bool {
        if target.order_ref(side).is_some() {
            return false;
        }
        if let Some(cid) = target.order_ref(side.opposite()) {
            // Unknown to the store means still in flight
            let active = orders.get(cid).map_or(true, |o| o.status.is_active());
            if active {
                return false;
            }
        }
        !self.submissions.contains_key(&(target.index, side))
            && !self.submissions.contains_key(&(target.index, side.opposite()))
    }

    /// Rotate one fill. Returns whether a counter order was placed.
    async fn rotate(
        &mut self,
        record: &StrategyRecord,
        store: &dyn GridStore,
        gateway: &dyn ExchangeGateway,
        levels: &mut [GridLevel],
        orders: &HashMap<String, Order>,
        fill: &Fill,
    ) -> GridResult<bool> {
        // An earlier rotation in this pass may have consumed the reference
        let still_referenced = levels
            .iter()
            .find(|l| l.index == fill.level_index)
            .is_some_and(|l| l.order_ref(fill.side) == Some(fill.order.client_order_id.as_str()));
        if !still_referenced {
            return Ok(false);
        }

        let new_side = fill.side.opposite();
        let target_index = match fill.side {
            OrderSide::Buy => fill.level_index.checked_add(1),
            OrderSide::Sell => fill.level_index.checked_sub(1),
        };
        let Some(target) = target_index.and_then(|i| levels.iter().find(|l| l.index == i)) else {
            debug!(
                "[{}] {} fill at boundary level {}, ladder ends here",
                record.id, fill.side, fill.level_index
            );
            return Ok(false);
        };

        if !self.is_free(target, new_side, orders) {
            info!(
                "[{}] Level {} already has an active order, skipping rotation of {}",
                record.id, target.index, fill.order.client_order_id
            );
            return Ok(false);
        }

        // Resolve the pair before placing; a counter order must never open a
        // second pair for a trade already on record
        let existing_pair = store
            .trade_pair_by_leg(record.id, fill.side, &fill.order.client_order_id)
            .await?;

        let size = counter_size(record.direction, fill, target);
        let request = LimitOrderRequest::new(target.index, &record.symbol, new_side, target.price, size)
            .reduce_only(is_reduce_only(record.direction, new_side));

        info!(
            "[{}] {} fill at level {} (price {}), placing {} {} @ {} on level {}",
            record.id,
            fill.side,
            fill.level_index,
            fill.order.price,
            new_side,
            size,
            target.price,
            target.index
        );

        let client_order_id = with_deadline(
            "create_limit_order",
            self.call_timeout,
            gateway.create_limit_order(&request),
        )
        .await?;

        let pair = pair_for_fill(record, fill, existing_pair, &client_order_id);
        let target_index = target.index;
        let mut submission = Submission {
            client_order_id,
            source_index: fill.level_index,
            source_side: fill.side,
            source_order: fill.order.client_order_id.clone(),
            pair,
            submitted_at: Instant::now(),
            linked: false,
        };

        let tx = link_transaction(record.id, target_index, new_side, &submission);
        match store.commit(tx).await {
            Ok(()) => {
                apply_link(levels, target_index, new_side, &submission);
                submission.linked = true;
            }
            Err(e) => {
                error!(
                    "[{}] Order {} placed but linking it to level {} failed: {}",
                    record.id, submission.client_order_id, target_index, e
                );
            }
        }
        self.submissions.insert((target_index, new_side), submission);
        Ok(true)
    }
}

/// Trade pair after `fill`: completes the pair waiting on this order, or opens
/// a new one waiting on the counter order.
fn pair_for_fill(
    record: &StrategyRecord,
    fill: &Fill,
    existing: Option<MatchedTradePair>,
    counter_order: &str,
) -> MatchedTradePair {
    let leg = TradeLeg::filled(&fill.order);
    match existing {
        Some(mut pair) => {
            pair.set_leg(fill.side, leg);
            if let Some(profit) = pair.realized_profit {
                info!("[{}] Round trip complete, profit {:.4}", record.id, profit);
            }
            pair
        }
        None => MatchedTradePair::open(record.id, &record.symbol, fill.side, leg, counter_order),
    }
}

/// Size of the counter order: the opening side reuses the fill size, the closing
/// side the level's configured quantity.
fn counter_size(direction: Direction, fill: &Fill, target: &GridLevel) -> f64 {
    let fill_size = if fill.order.filled_base > 0.0 {
        fill.order.filled_base
    } else {
        fill.order.base_size
    };
    match (direction, fill.side) {
        (Direction::Long, OrderSide::Buy) | (Direction::Short, OrderSide::Sell) => fill_size,
        _ => target.quantity,
    }
}

fn link_transaction(
    strategy_id: StrategyId,
    target_index: u32,
    target_side: OrderSide,
    submission: &Submission,
) -> StoreTransaction {
    let mut tx = StoreTransaction::new();
    tx.set_order_ref(strategy_id, submission.source_index, submission.source_side, None)
        .set_order_ref(
            strategy_id,
            target_index,
            target_side,
            Some(submission.client_order_id.clone()),
        )
        .upsert_trade_pair(submission.pair.clone());
    tx
}

/// Mirror a committed link on the in-memory ladder of the current pass
fn apply_link(levels: &mut [GridLevel], target_index: u32, target_side: OrderSide, submission: &Submission) {
    for level in levels.iter_mut() {
        if level.index == submission.source_index
            && level.order_ref(submission.source_side) == Some(submission.source_order.as_str())
        {
            match submission.source_side {
                OrderSide::Buy => level.buy_order = None,
                OrderSide::Sell => level.sell_order = None,
            }
        }
        if level.index == target_index {
            let cid = Some(submission.client_order_id.clone());
            match target_side {
                OrderSide::Buy => level.buy_order = cid,
                OrderSide::Sell => level.sell_order = cid,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::tests::sample_record;
    use crate::grid::executor::mock::MockGateway;
    use crate::grid::ladder::build_ladder;
    use crate::grid::state::{MemoryStore, StoreOp};
    use crate::grid::state::tests::order;
    use crate::grid::types::StrategyStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose trade pair reads can be made to fail
    struct PairReadFailStore {
        inner: MemoryStore,
        fail_pair_reads: AtomicBool,
    }

    #[async_trait]
    impl GridStore for PairReadFailStore {
        async fn get_strategy(&self, id: StrategyId) -> GridResult<Option<StrategyRecord>> {
            self.inner.get_strategy(id).await
        }

        async fn strategies_with_status(&self, status: StrategyStatus) -> GridResult<Vec<StrategyRecord>> {
            self.inner.strategies_with_status(status).await
        }

        async fn grid_levels(&self, id: StrategyId) -> GridResult<Vec<GridLevel>> {
            self.inner.grid_levels(id).await
        }

        async fn upsert_orders(&self, orders: &[Order]) -> GridResult<usize> {
            self.inner.upsert_orders(orders).await
        }

        async fn orders_by_client_ids(
            &self,
            venue: &str,
            account: &str,
            client_order_ids: &[String],
        ) -> GridResult<HashMap<String, Order>> {
            self.inner
                .orders_by_client_ids(venue, account, client_order_ids)
                .await
        }

        async fn trade_pair_by_leg(
            &self,
            id: StrategyId,
            side: OrderSide,
            client_order_id: &str,
        ) -> GridResult<Option<MatchedTradePair>> {
            if self.fail_pair_reads.load(Ordering::SeqCst) {
                return Err(GridError::Store("trade pair read failed".into()));
            }
            self.inner.trade_pair_by_leg(id, side, client_order_id).await
        }

        async fn trade_pairs(&self, id: StrategyId) -> GridResult<Vec<MatchedTradePair>> {
            self.inner.trade_pairs(id).await
        }

        async fn commit(&self, tx: StoreTransaction) -> GridResult<()> {
            self.inner.commit(tx).await
        }
    }

    fn filled(cid: &str, side: OrderSide, price: f64, ts: u64) -> Order {
        let mut o = order(cid, side, OrderStatus::Filled, ts);
        o.price = price;
        o.filled_base = 1.0;
        o.filled_quote = price;
        o
    }

    /// Ladder [100, 110, 120], long, buy "b0" resting at level 0
    async fn setup() -> (StrategyRecord, MemoryStore, MockGateway, GridRebalancer) {
        let record = sample_record();
        let store = MemoryStore::new();
        let mut tx = StoreTransaction::new();
        tx.push(StoreOp::SaveStrategy(record.clone()));
        tx.push(StoreOp::ReplaceGridLevels {
            id: record.id,
            levels: build_ladder(&record),
        });
        tx.set_order_ref(record.id, 0, OrderSide::Buy, Some("b0".into()));
        store.commit(tx).await.unwrap();
        store
            .upsert_orders(&[order("b0", OrderSide::Buy, OrderStatus::Open, 1)])
            .await
            .unwrap();

        let gateway = MockGateway::new("paper", "acct-1");
        let rebalancer = GridRebalancer::new(record.id, Duration::from_secs(60), Duration::from_secs(5));
        (record, store, gateway, rebalancer)
    }

    #[tokio::test]
    async fn test_open_order_needs_no_action() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        let outcome = rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(outcome, RebalanceOutcome::default());
        assert!(gateway.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_buy_fill_places_sell_one_level_up() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        store
            .upsert_orders(&[filled("b0", OrderSide::Buy, 100.0, 2)])
            .await
            .unwrap();

        let outcome = rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(outcome.placed, 1);

        let placed = gateway.placed_orders().await;
        assert_eq!(placed.len(), 1);
        let (cid, req) = &placed[0];
        assert_eq!(req.side, OrderSide::Sell);
        assert_eq!(req.level_index, 1);
        assert!((req.price - 110.0).abs() < 1e-9);
        assert!((req.size - 1.0).abs() < 1e-9);
        assert!(req.reduce_only);

        let levels = store.grid_levels(record.id).await.unwrap();
        assert_eq!(levels[0].buy_order, None);
        assert_eq!(levels[1].sell_order.as_deref(), Some(cid.as_str()));

        let pair = store
            .trade_pair_by_leg(record.id, OrderSide::Buy, "b0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pair.buy.as_ref().unwrap().client_order_id, "b0");
        assert!(pair.sell.is_none());
        assert_eq!(pair.pending_client_order_id.as_deref(), Some(cid.as_str()));
        assert_eq!(pair.realized_profit, None);
    }

    #[tokio::test]
    async fn test_sell_fill_completes_pair_and_rebuys() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        store
            .upsert_orders(&[filled("b0", OrderSide::Buy, 100.0, 2)])
            .await
            .unwrap();
        rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        let sell_cid = gateway.placed_orders().await[0].0.clone();

        store
            .upsert_orders(&[filled(&sell_cid, OrderSide::Sell, 110.0, 3)])
            .await
            .unwrap();
        let outcome = rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(outcome.placed, 1);

        let placed = gateway.placed_orders().await;
        let (buy_cid, req) = &placed[1];
        assert_eq!(req.side, OrderSide::Buy);
        assert_eq!(req.level_index, 0);
        assert!((req.price - 100.0).abs() < 1e-9);
        assert!((req.size - 1.0).abs() < 1e-9);
        assert!(!req.reduce_only);

        let levels = store.grid_levels(record.id).await.unwrap();
        assert_eq!(levels[1].sell_order, None);
        assert_eq!(levels[0].buy_order.as_deref(), Some(buy_cid.as_str()));

        let pairs = store.trade_pairs(record.id).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].is_complete());
        assert_eq!(pairs[0].realized_profit, Some(10.0));
    }

    #[tokio::test]
    async fn test_pair_read_failure_places_nothing() {
        let (record, inner, gateway, mut rebalancer) = setup().await;
        let store = PairReadFailStore {
            inner,
            fail_pair_reads: AtomicBool::new(false),
        };
        store
            .upsert_orders(&[filled("b0", OrderSide::Buy, 100.0, 2)])
            .await
            .unwrap();
        rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        let sell_cid = gateway.placed_orders().await[0].0.clone();

        store
            .upsert_orders(&[filled(&sell_cid, OrderSide::Sell, 110.0, 3)])
            .await
            .unwrap();
        store.fail_pair_reads.store(true, Ordering::SeqCst);
        let result = rebalancer.rebalance(&record, &store, &gateway).await;
        assert!(matches!(result, Err(GridError::Store(_))));

        // No counter order, the sell stays referenced and the open pair is intact
        assert_eq!(gateway.placed_orders().await.len(), 1);
        let levels = store.grid_levels(record.id).await.unwrap();
        assert_eq!(levels[1].sell_order.as_deref(), Some(sell_cid.as_str()));
        assert_eq!(levels[0].buy_order, None);
        let pairs = store.trade_pairs(record.id).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].buy.as_ref().unwrap().client_order_id, "b0");
        assert!(pairs[0].sell.is_none());

        store.fail_pair_reads.store(false, Ordering::SeqCst);
        let outcome = rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(outcome.placed, 1);
        let pairs = store.trade_pairs(record.id).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].is_complete());
        assert_eq!(pairs[0].realized_profit, Some(10.0));
    }

    #[tokio::test]
    async fn test_redelivered_fill_rotates_once() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        let fill = filled("b0", OrderSide::Buy, 100.0, 2);

        for _ in 0..3 {
            store.upsert_orders(&[fill.clone()]).await.unwrap();
            rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        }

        assert_eq!(gateway.placed_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_boundary_fill_places_nothing() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        let mut tx = StoreTransaction::new();
        tx.set_order_ref(record.id, 0, OrderSide::Buy, None);
        tx.set_order_ref(record.id, 2, OrderSide::Buy, Some("b2".into()));
        store.commit(tx).await.unwrap();
        store
            .upsert_orders(&[filled("b2", OrderSide::Buy, 120.0, 2)])
            .await
            .unwrap();

        let outcome = rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(outcome.placed, 0);
        assert!(gateway.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_busy_neighbour_defers_rotation() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        let mut tx = StoreTransaction::new();
        tx.set_order_ref(record.id, 1, OrderSide::Buy, Some("b1".into()));
        store.commit(tx).await.unwrap();
        store
            .upsert_orders(&[
                filled("b0", OrderSide::Buy, 100.0, 2),
                order("b1", OrderSide::Buy, OrderStatus::Open, 2),
            ])
            .await
            .unwrap();

        rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert!(gateway.placed_orders().await.is_empty());
        // The fill stays referenced so a later pass can rotate it
        let levels = store.grid_levels(record.id).await.unwrap();
        assert_eq!(levels[0].buy_order.as_deref(), Some("b0"));
    }

    #[tokio::test]
    async fn test_failed_placement_mutates_nothing() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        store
            .upsert_orders(&[filled("b0", OrderSide::Buy, 100.0, 2)])
            .await
            .unwrap();
        gateway.set_should_fail(true).await;

        assert!(rebalancer.rebalance(&record, &store, &gateway).await.is_err());

        let levels = store.grid_levels(record.id).await.unwrap();
        assert_eq!(levels[0].buy_order.as_deref(), Some("b0"));
        assert_eq!(levels[1].sell_order, None);
        assert!(store.trade_pairs(record.id).await.unwrap().is_empty());
        assert_eq!(rebalancer.pending_submissions(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_cancel_is_reported() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        store
            .upsert_orders(&[order("b0", OrderSide::Buy, OrderStatus::Canceled, 2)])
            .await
            .unwrap();

        let err = rebalancer
            .rebalance(&record, &store, &gateway)
            .await
            .unwrap_err();
        assert!(err.is_unexpected_cancel());
    }

    #[tokio::test]
    async fn test_orphaned_placement_is_relinked() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        store
            .upsert_orders(&[filled("b0", OrderSide::Buy, 100.0, 2)])
            .await
            .unwrap();

        store.set_fail_writes(true);
        let outcome = rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(outcome.placed, 1);
        assert_eq!(rebalancer.pending_submissions(), 1);

        // Link still failing: no second order for the same fill
        rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(gateway.placed_orders().await.len(), 1);

        store.set_fail_writes(false);
        let outcome = rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(outcome.relinked, 1);
        assert_eq!(outcome.placed, 0);

        let sell_cid = gateway.placed_orders().await[0].0.clone();
        let levels = store.grid_levels(record.id).await.unwrap();
        assert_eq!(levels[0].buy_order, None);
        assert_eq!(levels[1].sell_order.as_deref(), Some(sell_cid.as_str()));
        assert_eq!(store.trade_pairs(record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_submission_is_forgotten() {
        let (record, store, gateway, mut rebalancer) = setup().await;
        store
            .upsert_orders(&[filled("b0", OrderSide::Buy, 100.0, 2)])
            .await
            .unwrap();
        rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(rebalancer.pending_submissions(), 1);

        let sell_cid = gateway.placed_orders().await[0].0.clone();
        store
            .upsert_orders(&[order(&sell_cid, OrderSide::Sell, OrderStatus::Open, 3)])
            .await
            .unwrap();
        rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        assert_eq!(rebalancer.pending_submissions(), 0);
    }

    #[tokio::test]
    async fn test_short_grid_sizes() {
        let (mut record, store, gateway, mut rebalancer) = setup().await;
        record.direction = Direction::Short;
        let mut tx = StoreTransaction::new();
        tx.set_order_ref(record.id, 0, OrderSide::Buy, None);
        tx.set_order_ref(record.id, 2, OrderSide::Sell, Some("s2".into()));
        store.commit(tx).await.unwrap();

        let mut fill = filled("s2", OrderSide::Sell, 120.0, 2);
        fill.filled_base = 0.5;
        fill.filled_quote = 60.0;
        store.upsert_orders(&[fill]).await.unwrap();

        rebalancer.rebalance(&record, &store, &gateway).await.unwrap();
        let placed = gateway.placed_orders().await;
        let (_, req) = &placed[0];
        assert_eq!(req.side, OrderSide::Buy);
        assert_eq!(req.level_index, 1);
        // Opening sell size carries over, closing buy is reduce-only
        assert!((req.size - 0.5).abs() < 1e-9);
        assert!(req.reduce_only);
    }
}
