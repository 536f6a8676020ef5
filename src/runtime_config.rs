// =============================================================================
// Runtime Configuration: feed settings with env overrides and atomic save
// =============================================================================
//
// Every field carries a serde default so older or partial config files keep
// loading.  Persistence writes to a `.tmp` sibling and renames it into place.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::{CandleFeedSettings, OrderBookSettings, PriceFeedSettings, ReconnectConfig};
use crate::types::{Interval, SymbolSpec};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_price_throttle_ms() -> u64 {
    500
}

fn default_candle_throttle_ms() -> u64 {
    250
}

fn default_fallback_delay_ms() -> u64 {
    3000
}

fn default_history_limit() -> u32 {
    500
}

fn default_max_candles() -> usize {
    1000
}

fn default_sma_period() -> usize {
    20
}

fn default_ema_period() -> usize {
    50
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_fallback_price_decimals() -> u32 {
    2
}

fn default_fallback_amount_decimals() -> u32 {
    6
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Endpoints ----------------------------------------------------------
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Raw-stream base; per-symbol streams are appended as `/<stream>`, and
    /// the order book multiplexes over the bare URL.
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    // --- Initial selection ------------------------------------------------
    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    #[serde(default)]
    pub default_interval: Interval,

    // --- Timing -------------------------------------------------------------
    /// Minimum gap between published price updates.
    #[serde(default = "default_price_throttle_ms")]
    pub price_throttle_ms: u64,

    #[serde(default = "default_candle_throttle_ms")]
    pub candle_throttle_ms: u64,

    /// How long the price stream may stay silent before the REST fallback.
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    // --- Candles ------------------------------------------------------------
    /// Bars requested from REST on every (symbol, interval) selection.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    #[serde(default = "default_sma_period")]
    pub sma_period: usize,

    #[serde(default = "default_ema_period")]
    pub ema_period: usize,

    // --- Formatting -----------------------------------------------------------
    /// Decimal places used before exchange metadata is known.
    #[serde(default = "default_fallback_price_decimals")]
    pub fallback_price_decimals: u32,

    #[serde(default = "default_fallback_amount_decimals")]
    pub fallback_amount_decimals: u32,

    // --- API ------------------------------------------------------------------
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            default_symbol: default_symbol(),
            default_interval: Interval::default(),
            price_throttle_ms: default_price_throttle_ms(),
            candle_throttle_ms: default_candle_throttle_ms(),
            fallback_delay_ms: default_fallback_delay_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            history_limit: default_history_limit(),
            max_candles: default_max_candles(),
            sma_period: default_sma_period(),
            ema_period: default_ema_period(),
            fallback_price_decimals: default_fallback_price_decimals(),
            fallback_amount_decimals: default_fallback_amount_decimals(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.default_symbol,
            interval = %config.default_interval,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Load from `path`, falling back to defaults when it is missing or bad.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load feed config, using defaults");
            Self::default()
        })
    }

    /// Persist with an atomic write (`.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// Apply `FEED_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let present = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(symbol) = present("FEED_SYMBOL") {
            self.default_symbol = symbol;
        }
        if let Some(raw) = present("FEED_INTERVAL") {
            match raw.parse::<Interval>() {
                Ok(interval) => self.default_interval = interval,
                Err(e) => warn!(value = %raw, error = %e, "ignoring FEED_INTERVAL"),
            }
        }
        if let Some(addr) = present("FEED_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(url) = present("FEED_REST_URL") {
            self.rest_base_url = url;
        }
        if let Some(url) = present("FEED_WS_URL") {
            self.ws_base_url = url;
        }
    }

    pub fn initial_symbol(&self) -> Result<SymbolSpec> {
        SymbolSpec::parse(&self.default_symbol)
            .with_context(|| format!("invalid default symbol '{}'", self.default_symbol))
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig::from_millis(self.reconnect_initial_ms, self.reconnect_max_ms)
    }

    pub fn price_settings(&self) -> PriceFeedSettings {
        PriceFeedSettings {
            ws_base_url: self.ws_base_url.clone(),
            throttle: Duration::from_millis(self.price_throttle_ms),
            fallback_delay: Duration::from_millis(self.fallback_delay_ms),
            fallback_places: self.fallback_price_decimals,
            reconnect: self.reconnect(),
        }
    }

    pub fn candle_settings(&self) -> CandleFeedSettings {
        CandleFeedSettings {
            ws_base_url: self.ws_base_url.clone(),
            history_limit: self.history_limit,
            throttle: Duration::from_millis(self.candle_throttle_ms),
            sma_period: self.sma_period,
            ema_period: self.ema_period,
            max_candles: self.max_candles.max(self.history_limit as usize),
            reconnect: self.reconnect(),
        }
    }

    pub fn orderbook_settings(&self) -> OrderBookSettings {
        OrderBookSettings {
            ws_base_url: self.ws_base_url.clone(),
            reconnect: self.reconnect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.default_symbol, "BTCUSDT");
        assert_eq!(cfg.default_interval, Interval::M1);
        assert_eq!(cfg.price_throttle_ms, 500);
        assert_eq!(cfg.fallback_delay_ms, 3000);
        assert_eq!(cfg.history_limit, 500);
        assert_eq!(cfg.fallback_price_decimals, 2);
        assert_eq!(cfg.fallback_amount_decimals, 6);
        assert_eq!(cfg.reconnect().max_delay, Duration::from_secs(5));
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "default_symbol": "ETHUSDT", "default_interval": "15m", "price_throttle_ms": 100 }"#;
        let cfg: FeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.default_symbol, "ETHUSDT");
        assert_eq!(cfg.default_interval, Interval::M15);
        assert_eq!(cfg.price_throttle_ms, 100);
        assert_eq!(cfg.candle_throttle_ms, 250);
        assert_eq!(cfg.ema_period, 50);
    }

    #[test]
    fn month_interval_in_file_is_rejected() {
        assert!(serde_json::from_str::<FeedConfig>(r#"{ "default_interval": "1M" }"#).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FEED_SYMBOL", "sol/usdt"),
            ("FEED_INTERVAL", "4h"),
            ("FEED_BIND_ADDR", "127.0.0.1:9000"),
            ("FEED_WS_URL", " "),
        ]);
        let mut cfg = FeedConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.initial_symbol().unwrap().symbol, "SOLUSDT");
        assert_eq!(cfg.default_interval, Interval::H4);
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.ws_base_url, default_ws_base_url());
    }

    #[test]
    fn bad_interval_override_is_ignored() {
        let mut cfg = FeedConfig::default();
        cfg.apply_overrides(|k| (k == "FEED_INTERVAL").then(|| "7m".to_string()));
        assert_eq!(cfg.default_interval, Interval::M1);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("market-feed-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed_config.json");

        let mut cfg = FeedConfig::default();
        cfg.sma_period = 9;
        cfg.save(&path).unwrap();
        let loaded = FeedConfig::load(&path).unwrap();
        assert_eq!(loaded.sma_period, 9);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn settings_derive_from_config() {
        let cfg = FeedConfig::default();
        let price = cfg.price_settings();
        assert_eq!(price.throttle, Duration::from_millis(500));
        assert_eq!(price.fallback_delay, Duration::from_secs(3));
        let candles = cfg.candle_settings();
        assert!(candles.max_candles >= candles.history_limit as usize);
    }
}
