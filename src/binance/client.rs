// =============================================================================
// Binance REST API Client: public market-data endpoints
// =============================================================================
//
// Only unsigned endpoints are used: historical klines, exchange filters and
// the latest ticker price.  Every response updates the shared request-weight
// tracker, and a request that would exceed the weight cap is refused before
// it is sent.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::rate_limit::{
    WeightTracker, EXCHANGE_INFO_WEIGHT, KLINES_WEIGHT, TICKER_PRICE_WEIGHT,
};
use super::{MarketRest, SymbolFilters};
use crate::market_data::Candle;
use crate::types::Interval;

/// Minimum number of elements in a kline row: open time .. close time.
const KLINE_MIN_FIELDS: usize = 7;

/// Binance public REST client.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    weights: Arc<WeightTracker>,
}

impl BinanceClient {
    /// Create a client against `base_url` (e.g. `https://api.binance.com`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            weights: Arc::new(WeightTracker::new()),
        })
    }

    pub fn weights(&self) -> &Arc<WeightTracker> {
        &self.weights
    }

    /// GET `path` and return the JSON body, failing on non-2xx statuses.
    async fn get_json(&self, path: &str, weight: u32) -> Result<serde_json::Value> {
        if !self.weights.can_send_request(weight) {
            anyhow::bail!("request weight budget exhausted, skipping GET {path}");
        }

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.weights.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {} returned {}: {}", path, status, body);
        }
        Ok(body)
    }

    /// GET /api/v3/klines
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, ...
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: Interval, limit: u32) -> Result<Vec<Candle>> {
        let path = format!(
            "/api/v3/klines?symbol={}&interval={}&limit={}",
            symbol,
            interval.as_str(),
            limit
        );
        let body = self.get_json(&path, KLINES_WEIGHT).await?;
        let candles = parse_klines(&body)?;
        debug!(symbol, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/exchangeInfo filtered by symbol.
    #[instrument(skip(self), name = "binance::get_symbol_filters")]
    pub async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let path = format!("/api/v3/exchangeInfo?symbol={symbol}");
        let body = self.get_json(&path, EXCHANGE_INFO_WEIGHT).await?;
        let filters = parse_symbol_filters(&body)
            .with_context(|| format!("exchangeInfo for {symbol} has no usable filters"))?;
        debug!(symbol, tick = filters.tick_size, step = filters.step_size, "symbol filters retrieved");
        Ok(filters)
    }

    /// GET /api/v3/ticker/price for a single symbol.
    #[instrument(skip(self), name = "binance::get_ticker_price")]
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<String> {
        let path = format!("/api/v3/ticker/price?symbol={symbol}");
        let body = self.get_json(&path, TICKER_PRICE_WEIGHT).await?;
        let price = body["price"]
            .as_str()
            .context("ticker response missing 'price'")?;
        price
            .parse::<f64>()
            .with_context(|| format!("ticker price '{price}' is not numeric"))?;
        Ok(price.to_string())
    }
}

#[async_trait]
impl MarketRest for BinanceClient {
    async fn klines(&self, symbol: &str, interval: Interval, limit: u32) -> Result<Vec<Candle>> {
        self.get_klines(symbol, interval, limit).await
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        self.get_symbol_filters(symbol).await
    }

    async fn last_price(&self, symbol: &str) -> Result<String> {
        self.get_ticker_price(symbol).await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("weights", &self.weights)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Parse the array-of-arrays kline response.  Short rows are skipped.
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;
    let mut candles = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < KLINE_MIN_FIELDS {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let open_time = arr[0].as_i64().context("kline open time is not an integer")?;
        let open = parse_str_f64(&arr[1])?;
        let high = parse_str_f64(&arr[2])?;
        let low = parse_str_f64(&arr[3])?;
        let close = parse_str_f64(&arr[4])?;
        let volume = parse_str_f64(&arr[5])?;
        let close_time = arr[6].as_i64().context("kline close time is not an integer")?;
        let quote_volume = match arr.get(7) {
            Some(v) => parse_str_f64(v)?,
            None => volume * close,
        };

        candles.push(Candle {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
        });
    }

    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

/// Pull PRICE_FILTER.tickSize and LOT_SIZE.stepSize out of an exchangeInfo body.
pub fn parse_symbol_filters(body: &serde_json::Value) -> Result<SymbolFilters> {
    let filters = body["symbols"]
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|s| s["filters"].as_array())
        .context("symbol not found in exchangeInfo response")?;

    let find = |filter_type: &str, field: &str| -> Result<f64> {
        let entry = filters
            .iter()
            .find(|f| f["filterType"].as_str() == Some(filter_type))
            .with_context(|| format!("missing {filter_type} filter"))?;
        parse_str_f64(&entry[field]).with_context(|| format!("bad {filter_type}.{field}"))
    };

    Ok(SymbolFilters {
        tick_size: find("PRICE_FILTER", "tickSize")?,
        step_size: find("LOT_SIZE", "stepSize")?,
    })
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_kline_rows() {
        let body = json!([
            [1700000060000i64, "101.0", "103.0", "100.5", "102.0", "4.0", 1700000119999i64, "408.0", 12, "2.0", "204.0", "0"],
            [1700000000000i64, "100.0", "102.0", "99.0", "101.0", "5.5", 1700000059999i64, "555.5", 10, "3.0", "303.0", "0"],
            [1700000120000i64, "1.0"]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 1_700_000_000_000);
        assert!((candles[1].close - 102.0).abs() < f64::EPSILON);
        assert!((candles[0].quote_volume - 555.5).abs() < f64::EPSILON);
    }

    #[test]
    fn kline_with_bad_number_fails() {
        let body = json!([[0, "x", "1", "1", "1", "1", 59999]]);
        assert!(parse_klines(&body).is_err());
    }

    #[test]
    fn parses_exchange_filters() {
        let body = json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "filters": [
                    { "filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000.00", "tickSize": "0.01000000" },
                    { "filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000.0", "stepSize": "0.00001000" }
                ]
            }]
        });
        let filters = parse_symbol_filters(&body).unwrap();
        assert!((filters.tick_size - 0.01).abs() < 1e-12);
        assert!((filters.step_size - 0.00001).abs() < 1e-12);
    }

    #[test]
    fn missing_lot_size_is_an_error() {
        let body = json!({
            "symbols": [{ "filters": [{ "filterType": "PRICE_FILTER", "tickSize": "0.1" }] }]
        });
        assert!(parse_symbol_filters(&body).is_err());
        assert!(parse_symbol_filters(&json!({ "symbols": [] })).is_err());
    }
}
