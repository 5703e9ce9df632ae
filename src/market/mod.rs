//! Venue implementations behind [`crate::grid::ExchangeGateway`]

mod paper;

pub use paper::{oscillating_price, PaperGateway, PaperPosition, PaperVenue};
