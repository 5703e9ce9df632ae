//! Grid strategy configuration checks

use super::errors::{GridError, GridResult};
use super::types::{StrategyRecord, StrategyStatus};

/// Highest leverage a strategy may request
pub const MAX_LEVERAGE: u32 = 100;

impl StrategyRecord {
    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }

        if self.venue.is_empty() || self.account.is_empty() {
            return Err(GridError::InvalidConfig(
                "venue and account are required".into(),
            ));
        }

        if !(self.lower_price > 0.0) {
            return Err(GridError::InvalidConfig(
                "lower_price must be positive".into(),
            ));
        }

        if self.lower_price >= self.upper_price {
            return Err(GridError::InvalidConfig(
                "lower_price must be less than upper_price".into(),
            ));
        }

        if self.grid_count < 2 {
            return Err(GridError::InvalidConfig(
                "grid_count must be at least 2".into(),
            ));
        }

        if !(self.order_size > 0.0) {
            return Err(GridError::InvalidConfig(
                "order_size must be positive".into(),
            ));
        }

        if self.leverage == 0 || self.leverage > MAX_LEVERAGE {
            return Err(GridError::InvalidConfig(format!(
                "leverage must be between 1 and {}",
                MAX_LEVERAGE
            )));
        }

        Ok(())
    }

    /// Initial margin needed to rest one order at every level
    pub fn required_margin(&self, prices: &[f64]) -> f64 {
        let notional: f64 = prices.iter().map(|p| p * self.order_size).sum();
        notional / self.leverage as f64
    }

    /// Reject the strategy when the account cannot fund the ladder
    pub fn check_margin(&self, prices: &[f64], available: f64) -> GridResult<()> {
        let required = self.required_margin(prices);
        if required > available {
            return Err(GridError::InsufficientMargin {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Check that `updated` only touches fields that may change while the strategy runs.
    ///
    /// Inactive strategies may be edited freely; active ones only accept a new `name`.
    pub fn check_live_edit(&self, updated: &StrategyRecord) -> GridResult<()> {
        if self.id != updated.id {
            return Err(GridError::InvalidState(format!(
                "cannot replace strategy {} with {}",
                self.id, updated.id
            )));
        }

        if self.status == StrategyStatus::Inactive {
            return Ok(());
        }

        let mut comparable = updated.clone();
        comparable.name = self.name.clone();
        if &comparable != self {
            return Err(GridError::InvalidState(format!(
                "strategy {} is active; only the name can change",
                self.id
            )));
        }
        Ok(())
    }
}
