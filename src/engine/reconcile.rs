//! Order reconciliation - merges venue order batches into the durable store

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::grid::{
    with_deadline, ExchangeGateway, GridError, GridResult, GridStore, StrategyId, UserOrderEvent,
};

/// Applies order batches to the store
pub struct OrderReconciler {
    store: Arc<dyn GridStore>,
    call_timeout: Duration,
}

impl OrderReconciler {
    pub fn new(store: Arc<dyn GridStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Apply one batch.
    ///
    /// Snapshot batches first pull the account's full order history through the
    /// running strategies' gateways, in the given order, until one pull succeeds.
    /// All strategies on an account share one order history, so one success is
    /// enough. If every pull fails the batch is not persisted.
    ///
    /// The batch itself is upserted atomically. Returns how many stored orders changed.
    pub async fn apply(
        &self,
        event: &UserOrderEvent,
        resync_via: &[(StrategyId, Arc<dyn ExchangeGateway>)],
    ) -> GridResult<usize> {
        let account = event.account_key();

        if event.is_snapshot {
            self.resync(event, resync_via).await?;
        }

        let changed = self.store.upsert_orders(&event.orders).await?;
        debug!(
            "Reconciled {} batch for {}: {} orders, {} changed",
            if event.is_snapshot { "snapshot" } else { "delta" },
            account,
            event.orders.len(),
            changed
        );
        Ok(changed)
    }

    async fn resync(
        &self,
        event: &UserOrderEvent,
        resync_via: &[(StrategyId, Arc<dyn ExchangeGateway>)],
    ) -> GridResult<()> {
        let account = event.account_key();
        if resync_via.is_empty() {
            debug!("Snapshot for {} with no running strategies, skipping resync", account);
            return Ok(());
        }

        for (strategy_id, gateway) in resync_via {
            let pulled = with_deadline(
                "sync_user_orders",
                self.call_timeout,
                gateway.sync_user_orders(),
            )
            .await;

            let result = match pulled {
                Ok(orders) => self.store.upsert_orders(&orders).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(changed) => {
                    info!(
                        "Resynced {} via strategy {}: {} orders changed",
                        account, strategy_id, changed
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Resync of {} via strategy {} failed: {}",
                        account, strategy_id, e
                    );
                }
            }
        }

        Err(GridError::Reconciliation {
            account,
            attempts: resync_via.len(),
        })
    }
}
