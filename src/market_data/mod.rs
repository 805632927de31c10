pub mod candles;
pub mod price_buffer;
pub mod price_feed;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candles::{Candle, CandleSeries};
pub use price_buffer::PriceBuffer;
