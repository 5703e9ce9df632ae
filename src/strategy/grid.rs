use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use super::{Strategy, StrategyContext, StrategyFactory};
use crate::grid::{
    ExchangeGateway, GridRebalancer, GridResult, GridStore, StrategyRecord,
};

/// Grid strategy: rotates fills along a static ladder
pub struct GridStrategy {
    record: RwLock<StrategyRecord>,
    rebalancer: Mutex<GridRebalancer>,
    store: Arc<dyn GridStore>,
    gateway: Arc<dyn ExchangeGateway>,
}

impl GridStrategy {
    pub fn new(record: StrategyRecord, ctx: StrategyContext) -> Self {
        let rebalancer = GridRebalancer::new(record.id, ctx.recent_order_ttl, ctx.call_timeout);
        Self {
            record: RwLock::new(record),
            rebalancer: Mutex::new(rebalancer),
            store: ctx.store,
            gateway: ctx.gateway,
        }
    }
}

#[async_trait]
impl Strategy for GridStrategy {
    fn get(&self) -> StrategyRecord {
        self.record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, record: StrategyRecord) -> GridResult<()> {
        let mut current = self.record.write().unwrap_or_else(|e| e.into_inner());
        current.check_live_edit(&record)?;
        info!("[{}] Configuration updated (name: {:?})", record.id, record.name);
        *current = record;
        Ok(())
    }

    async fn on_orders_changed(&self) -> GridResult<()> {
        let record = self.get();
        let mut rebalancer = self.rebalancer.lock().await;
        rebalancer
            .rebalance(&record, self.store.as_ref(), self.gateway.as_ref())
            .await
            .map(|_| ())
    }
}

/// Builds [`GridStrategy`] instances
pub struct GridStrategyFactory;

impl StrategyFactory for GridStrategyFactory {
    fn create(&self, record: StrategyRecord, ctx: StrategyContext) -> GridResult<Arc<dyn Strategy>> {
        record.validate()?;
        Ok(Arc::new(GridStrategy::new(record, ctx)))
    }
}
