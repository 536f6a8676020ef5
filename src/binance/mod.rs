// =============================================================================
// Exchange REST access
// =============================================================================
//
// Managers never talk to reqwest directly; they hold an `Arc<dyn MarketRest>`
// so the REST side can be swapped for a fake in tests.

pub mod client;
pub mod rate_limit;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;
use crate::types::Interval;

pub use client::BinanceClient;
pub use rate_limit::WeightTracker;

/// Exchange filter metadata needed to derive display precision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
}

/// Public market-data REST endpoints used by the streaming managers.
#[async_trait]
pub trait MarketRest: Send + Sync {
    /// Historical bars, oldest first.
    async fn klines(&self, symbol: &str, interval: Interval, limit: u32) -> Result<Vec<Candle>>;

    /// Tick size / step size for one symbol.
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    /// Latest traded price as the exchange's numeric string.
    async fn last_price(&self, symbol: &str) -> Result<String>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{MarketRest, SymbolFilters};
    use crate::market_data::Candle;
    use crate::types::Interval;

    /// In-memory REST double.  Unknown symbols return errors; per-symbol
    /// delays let tests hold a response back past a selection change.
    #[derive(Default)]
    pub struct FakeRest {
        filters: Mutex<HashMap<String, SymbolFilters>>,
        prices: Mutex<HashMap<String, String>>,
        klines: Mutex<HashMap<String, Vec<Candle>>>,
        delays: Mutex<HashMap<String, Duration>>,
        filter_calls: AtomicUsize,
        kline_calls: AtomicUsize,
        price_calls: AtomicUsize,
    }

    impl FakeRest {
        pub fn set_filters(&self, symbol: &str, tick_size: f64, step_size: f64) {
            self.filters.lock().insert(
                symbol.to_string(),
                SymbolFilters {
                    tick_size,
                    step_size,
                },
            );
        }

        pub fn set_price(&self, symbol: &str, price: &str) {
            self.prices
                .lock()
                .insert(symbol.to_string(), price.to_string());
        }

        pub fn set_klines(&self, symbol: &str, candles: Vec<Candle>) {
            self.klines.lock().insert(symbol.to_string(), candles);
        }

        pub fn set_delay(&self, symbol: &str, delay: Duration) {
            self.delays.lock().insert(symbol.to_string(), delay);
        }

        pub fn filter_calls(&self) -> usize {
            self.filter_calls.load(Ordering::SeqCst)
        }

        pub fn kline_calls(&self) -> usize {
            self.kline_calls.load(Ordering::SeqCst)
        }

        pub fn price_calls(&self) -> usize {
            self.price_calls.load(Ordering::SeqCst)
        }

        async fn maybe_delay(&self, symbol: &str) {
            let delay = self.delays.lock().get(symbol).copied();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
        }
    }

    #[async_trait]
    impl MarketRest for FakeRest {
        async fn klines(&self, symbol: &str, _interval: Interval, limit: u32) -> Result<Vec<Candle>> {
            self.kline_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_delay(symbol).await;
            let rows = self
                .klines
                .lock()
                .get(symbol)
                .cloned()
                .ok_or_else(|| anyhow!("no klines for {symbol}"))?;
            let start = rows.len().saturating_sub(limit as usize);
            Ok(rows[start..].to_vec())
        }

        async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
            self.filter_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_delay(symbol).await;
            self.filters
                .lock()
                .get(symbol)
                .copied()
                .ok_or_else(|| anyhow!("no filters for {symbol}"))
        }

        async fn last_price(&self, symbol: &str) -> Result<String> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_delay(symbol).await;
            self.prices
                .lock()
                .get(symbol)
                .cloned()
                .ok_or_else(|| anyhow!("no price for {symbol}"))
        }
    }
}
