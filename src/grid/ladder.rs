//! Ladder generation - price levels and the opening orders of a grid

use super::types::{Direction, GridLevel, LimitOrderRequest, OrderSide, QuantityMode, StrategyRecord};

/// Calculate the ladder prices from lower to upper bound inclusive
pub fn calculate_prices(mode: QuantityMode, lower: f64, upper: f64, count: u32) -> Vec<f64> {
    let steps = (count.max(2) - 1) as f64;
    (0..count)
        .map(|i| match mode {
            // Uniform spacing: lower + step * i
            QuantityMode::Arithmetic => lower + (upper - lower) / steps * i as f64,
            // Percentage spacing: lower * ratio^i
            QuantityMode::Geometric => lower * (upper / lower).powf(i as f64 / steps),
        })
        .collect()
}

/// Build the full ladder for a strategy. Called once when the strategy starts.
pub fn build_ladder(record: &StrategyRecord) -> Vec<GridLevel> {
    calculate_prices(
        record.quantity_mode,
        record.lower_price,
        record.upper_price,
        record.grid_count,
    )
    .into_iter()
    .enumerate()
    .map(|(i, price)| GridLevel::new(record.id, i as u32, price, record.order_size))
    .collect()
}

/// Opening orders for a fresh ladder.
///
/// Long grids rest a buy at every level below the mark, short grids a sell at every
/// level above it. The remaining levels are filled in by rotation.
pub fn opening_orders(record: &StrategyRecord, levels: &[GridLevel], mark_price: f64) -> Vec<LimitOrderRequest> {
    levels
        .iter()
        .filter_map(|level| match record.direction {
            Direction::Long if level.price < mark_price => Some(LimitOrderRequest::new(
                level.index,
                &record.symbol,
                OrderSide::Buy,
                level.price,
                level.quantity,
            )),
            Direction::Short if level.price > mark_price => Some(LimitOrderRequest::new(
                level.index,
                &record.symbol,
                OrderSide::Sell,
                level.price,
                level.quantity,
            )),
            _ => None,
        })
        .collect()
}

/// Closing orders are reduce-only: sells for long grids, buys for short grids
pub fn is_reduce_only(direction: Direction, side: OrderSide) -> bool {
    match direction {
        Direction::Long => side == OrderSide::Sell,
        Direction::Short => side == OrderSide::Buy,
    }
}
