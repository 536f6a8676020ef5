// =============================================================================
// Precision: exchange-correct decimal places for prices and amounts
// =============================================================================

pub mod formatter;

use anyhow::Result;
use tracing::{debug, warn};

use crate::binance::MarketRest;
use crate::cache::SymbolCache;

pub use formatter::{
    compact_number, decimal_hint, derive_precision, effective_places, format_amount,
    format_price, format_truncated, PrecisionSpec, MAX_DECIMAL_PLACES, MISSING_VALUE,
};

/// Per-symbol precision, cached for the process lifetime.
pub type PrecisionCache = SymbolCache<PrecisionSpec>;

/// Return the cached spec for `symbol`, fetching exchange filters on a miss.
///
/// Failures are not cached so the next selection of the symbol retries.
pub async fn load_precision(
    cache: &PrecisionCache,
    rest: &dyn MarketRest,
    symbol: &str,
) -> Result<PrecisionSpec> {
    if let Some(spec) = cache.get(symbol) {
        return Ok(spec);
    }

    let filters = match rest.symbol_filters(symbol).await {
        Ok(f) => f,
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "symbol metadata unavailable");
            return Err(e);
        }
    };

    let spec = derive_precision(filters.tick_size, filters.step_size);
    debug!(
        symbol = %symbol,
        price_places = spec.price_places,
        quantity_places = spec.quantity_places,
        "precision derived"
    );
    cache.insert(symbol, spec);
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::testing::FakeRest;

    #[tokio::test]
    async fn load_fetches_once_then_caches() {
        let rest = FakeRest::default();
        rest.set_filters("BTCUSDT", 0.01, 0.00001);
        let cache = PrecisionCache::new();

        let spec = load_precision(&cache, &rest, "BTCUSDT").await.unwrap();
        assert_eq!(spec.price_places, 2);
        assert_eq!(spec.quantity_places, 5);

        let _ = load_precision(&cache, &rest, "BTCUSDT").await.unwrap();
        assert_eq!(rest.filter_calls(), 1);
    }

    #[tokio::test]
    async fn load_failure_is_not_cached() {
        let rest = FakeRest::default();
        let cache = PrecisionCache::new();

        assert!(load_precision(&cache, &rest, "XRPUSDT").await.is_err());
        assert!(!cache.contains("XRPUSDT"));
    }
}
