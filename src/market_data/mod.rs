// =============================================================================
// Live market data: price, candles and order book for one selected symbol
// =============================================================================

pub mod backoff;
pub mod candle_stream;
pub mod candles;
pub mod orderbook;
pub mod price_stream;
pub mod session;
pub mod subscription;
pub mod throttle;
pub mod wire;

pub use backoff::ReconnectConfig;
pub use candle_stream::{CandleAggregator, CandleFeedSettings, CandleSnapshot};
pub use candles::{Candle, CandleKey, CandleSeries, VolumeBar};
pub use orderbook::{OrderBookSettings, OrderBookSnapshot, OrderBookStreamManager};
pub use price_stream::{
    PriceCache, PriceFeedDeps, PriceFeedSettings, PricePoint, PriceSnapshot, PriceStreamManager,
};
pub use subscription::{StreamSubscription, SubscriptionTag};
pub use wire::{BookLevel, OrderBookTop, TickerUpdate, TradeTick};
