// =============================================================================
// market-feed: live price, candle and order-book streams for one selection
// =============================================================================

pub mod api;
pub mod app_state;
pub mod binance;
pub mod cache;
pub mod indicators;
pub mod market_data;
pub mod precision;
pub mod runtime_config;
pub mod types;
