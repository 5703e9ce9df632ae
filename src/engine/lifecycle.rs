//! Strategy launch and teardown around the engine

use std::sync::Arc;

use futures_util::future::BoxFuture;
use log::{error, info, warn};

use super::{StrategyEngine, UnexpectedCancelHandler};
use crate::grid::ladder::{build_ladder, opening_orders};
use crate::grid::{
    with_deadline, Direction, ExchangeGateway, GridError, GridLevel, GridResult, OrderSide, StoreOp,
    StoreTransaction, StrategyId, StrategyRecord, StrategyStatus,
};
use crate::strategy::Strategy;

/// Launch a new strategy: check it can be funded, set leverage, lay out the ladder,
/// place the opening orders, persist everything as active in one transaction and
/// hand it to the engine.
///
/// An error from the final engine start means the subscription is not up yet; the
/// strategy is still running and persisted.
pub async fn launch_strategy(
    engine: &StrategyEngine,
    strategy: Arc<dyn Strategy>,
    gateway: Arc<dyn ExchangeGateway>,
) -> GridResult<StrategyRecord> {
    let mut record = strategy.get();
    if record.status == StrategyStatus::Active {
        return Err(GridError::InvalidState(format!(
            "strategy {} is already active",
            record.id
        )));
    }
    record.validate()?;

    let timeout = engine.config().call_timeout();
    let mid_price = with_deadline("get_mid_price", timeout, gateway.get_mid_price(&record.symbol)).await?;
    let margin = with_deadline("get_margin_info", timeout, gateway.get_margin_info()).await?;

    let mut levels = build_ladder(&record);
    let prices: Vec<f64> = levels.iter().map(|l| l.price).collect();
    record.check_margin(&prices, margin.available_margin)?;

    with_deadline(
        "update_leverage",
        timeout,
        gateway.update_leverage(&record.symbol, record.leverage, record.margin_mode),
    )
    .await?;

    info!(
        "[{}] Launching {} grid on {} {}: {} levels in [{}, {}], mid {}",
        record.id,
        if record.direction == Direction::Long { "long" } else { "short" },
        record.venue,
        record.symbol,
        levels.len(),
        record.lower_price,
        record.upper_price,
        mid_price
    );

    // Opening orders add exposure, so none of them is reduce-only
    for request in opening_orders(&record, &levels, mid_price) {
        let placed = with_deadline("create_limit_order", timeout, gateway.create_limit_order(&request)).await;
        match placed {
            Ok(client_order_id) => {
                if let Some(level) = levels.iter_mut().find(|l| l.index == request.level_index) {
                    match request.side {
                        OrderSide::Buy => level.buy_order = Some(client_order_id),
                        OrderSide::Sell => level.sell_order = Some(client_order_id),
                    }
                }
            }
            Err(e) => {
                error!(
                    "[{}] Opening order at level {} failed: {}",
                    record.id, request.level_index, e
                );
                rollback(&record, gateway.as_ref(), timeout, &levels).await;
                return Err(e);
            }
        }
    }

    record.status = StrategyStatus::Active;
    let mut tx = StoreTransaction::new();
    tx.push(StoreOp::SaveStrategy(record.clone()));
    tx.push(StoreOp::ReplaceGridLevels {
        id: record.id,
        levels: levels.clone(),
    });
    if let Err(e) = engine.store().commit(tx).await {
        error!("[{}] Persisting the launched ladder failed: {}", record.id, e);
        rollback(&record, gateway.as_ref(), timeout, &levels).await;
        return Err(e);
    }

    strategy.update(record.clone())?;
    engine.start_strategy(strategy, gateway).await?;
    Ok(record)
}

/// Restart a strategy that is already active in the store, keeping its ladder
pub async fn resume_strategy(
    engine: &StrategyEngine,
    strategy: Arc<dyn Strategy>,
    gateway: Arc<dyn ExchangeGateway>,
) -> GridResult<StrategyRecord> {
    let record = strategy.get();
    let levels = engine.store().grid_levels(record.id).await?;
    if record.status != StrategyStatus::Active || levels.is_empty() {
        return Err(GridError::InvalidState(format!(
            "strategy {} has no active ladder to resume",
            record.id
        )));
    }

    info!("[{}] Resuming with {} levels", record.id, levels.len());
    engine.start_strategy(strategy, gateway).await?;
    Ok(record)
}

/// Stop a strategy for good: deregister it, cancel its orders, delete its ladder and
/// mark it inactive.
pub async fn halt_strategy(
    engine: &StrategyEngine,
    gateway: Arc<dyn ExchangeGateway>,
    id: StrategyId,
) -> GridResult<StrategyRecord> {
    let mut record = match engine.stop_strategy(id).await {
        Ok(record) => record,
        Err(GridError::StrategyNotFound(_)) => engine
            .store()
            .get_strategy(id)
            .await?
            .ok_or(GridError::StrategyNotFound(id))?,
        Err(e) => return Err(e),
    };

    let timeout = engine.config().call_timeout();
    let cancelled = with_deadline(
        "cancel_all_orders",
        timeout,
        gateway.cancel_all_orders(&record.symbol),
    )
    .await?;

    record.status = StrategyStatus::Inactive;
    let mut tx = StoreTransaction::new();
    tx.push(StoreOp::DeleteGridLevels(id));
    tx.push(StoreOp::SaveStrategy(record.clone()));
    engine.store().commit(tx).await?;

    info!("[{}] Halted, {} orders cancelled", id, cancelled);
    Ok(record)
}

/// Cancel the opening orders placed so far. Other orders on the symbol, such as
/// another strategy's ladder on the same account, are left alone.
async fn rollback(
    record: &StrategyRecord,
    gateway: &dyn ExchangeGateway,
    timeout: std::time::Duration,
    levels: &[GridLevel],
) {
    let mut cancelled = 0;
    for client_order_id in levels
        .iter()
        .flat_map(|l| [l.buy_order.as_deref(), l.sell_order.as_deref()])
        .flatten()
    {
        match with_deadline(
            "cancel_order",
            timeout,
            gateway.cancel_order(&record.symbol, client_order_id),
        )
        .await
        {
            Ok(()) => cancelled += 1,
            Err(e) => error!(
                "[{}] Rolling back opening order {} failed: {}",
                record.id, client_order_id, e
            ),
        }
    }
    info!("[{}] Rolled back {} opening orders", record.id, cancelled);
}

/// Halts the strategy and logs a notice for its owner
pub fn default_unexpected_cancel_handler() -> UnexpectedCancelHandler {
    Arc::new(|engine: StrategyEngine, record: StrategyRecord| -> BoxFuture<'static, ()> {
        Box::pin(async move {
            warn!(
                "[{}] Order canceled outside the grid, stopping strategy {:?}",
                record.id, record.name
            );

            let Some(gateway) = engine.gateway_for(record.id).await else {
                warn!("[{}] Already stopped", record.id);
                return;
            };

            match halt_strategy(&engine, gateway, record.id).await {
                Ok(_) => warn!(
                    "Notify {}: strategy {:?} ({} {}) was stopped after an unexpected order cancellation",
                    record.owner, record.name, record.venue, record.symbol
                ),
                Err(e) => error!("[{}] Forced stop failed: {}", record.id, e),
            }
        })
    })
}
