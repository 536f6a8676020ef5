// =============================================================================
// Shared types used across the market-feed core
// =============================================================================

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// SymbolSpec
// =============================================================================

/// Quote assets recognised when splitting a concatenated exchange symbol.
/// Matched longest-first so `BTCFDUSD` splits as `BTC` / `FDUSD`.
const KNOWN_QUOTES: &[&str] = &[
    "FDUSD", "USDT", "USDC", "TUSD", "BUSD", "DAI", "BTC", "ETH", "BNB", "EUR", "TRY", "BRL",
    "GBP", "JPY",
];

/// A normalized trading pair.  Immutable once built; re-derived whenever the
/// selected symbol changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub base: String,
    pub quote: String,
    /// Exchange-native symbol, e.g. `BTCUSDT`.
    pub symbol: String,
}

impl SymbolSpec {
    pub fn new(base: &str, quote: &str) -> Result<Self> {
        let base = normalize_asset(base).context("invalid base asset")?;
        let quote = normalize_asset(quote).context("invalid quote asset")?;
        let symbol = format!("{base}{quote}");
        Ok(Self {
            base,
            quote,
            symbol,
        })
    }

    /// Parse `BTCUSDT`, `BTC/USDT`, `btc-usdt` or `BTC_USDT`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("empty symbol");
        }

        if let Some((base, quote)) = trimmed.split_once(['/', '-', '_']) {
            return Self::new(base, quote);
        }

        let upper = trimmed.to_ascii_uppercase();
        let mut quotes: Vec<&str> = KNOWN_QUOTES.to_vec();
        quotes.sort_by_key(|q| std::cmp::Reverse(q.len()));

        for quote in quotes {
            if let Some(base) = upper.strip_suffix(quote) {
                if !base.is_empty() {
                    return Self::new(base, quote);
                }
            }
        }

        bail!("cannot determine quote asset of symbol '{trimmed}'")
    }

    pub fn exchange_symbol(&self) -> &str {
        &self.symbol
    }

    /// Lower-case form used in stream names (`btcusdt@trade`).
    pub fn stream_name(&self) -> String {
        self.symbol.to_ascii_lowercase()
    }
}

fn normalize_asset(raw: &str) -> Result<String> {
    let asset = raw.trim().to_ascii_uppercase();
    if asset.is_empty() {
        bail!("asset is empty");
    }
    if !asset.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("asset '{asset}' contains non-alphanumeric characters");
    }
    Ok(asset)
}

impl FromStr for SymbolSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SymbolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

// =============================================================================
// Interval
// =============================================================================

/// Fixed-width kline intervals.  Month bars are not fixed width and are
/// deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    S1,
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Self::S1,
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S1 => "1s",
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
        }
    }

    /// Bucket width in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        const SEC: i64 = 1_000;
        const MIN: i64 = 60 * SEC;
        const HOUR: i64 = 60 * MIN;
        const DAY: i64 = 24 * HOUR;
        match self {
            Self::S1 => SEC,
            Self::M1 => MIN,
            Self::M3 => 3 * MIN,
            Self::M5 => 5 * MIN,
            Self::M15 => 15 * MIN,
            Self::M30 => 30 * MIN,
            Self::H1 => HOUR,
            Self::H2 => 2 * HOUR,
            Self::H4 => 4 * HOUR,
            Self::H6 => 6 * HOUR,
            Self::H8 => 8 * HOUR,
            Self::H12 => 12 * HOUR,
            Self::D1 => DAY,
            Self::D3 => 3 * DAY,
            Self::W1 => 7 * DAY,
        }
    }

    /// Where bucket boundaries sit relative to the epoch.  Weekly bars open
    /// on Monday 00:00 UTC; the epoch fell on a Thursday.
    pub fn alignment_offset_ms(&self) -> i64 {
        const DAY: i64 = 86_400_000;
        match self {
            Self::W1 => 4 * DAY,
            _ => 0,
        }
    }

    /// Start of the bucket containing `ts_ms`, flooring toward negative
    /// infinity.
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        let width = self.duration_ms();
        let offset = self.alignment_offset_ms();
        (ts_ms - offset).div_euclid(width) * width + offset
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::M1
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        // "1M" is the exchange's month interval; everything else is case-insensitive.
        if trimmed == "1M" {
            bail!("month interval '1M' has no fixed width");
        }
        let lower = trimmed.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|iv| iv.as_str() == lower)
            .with_context(|| format!("unsupported interval '{trimmed}'"))
    }
}

impl TryFrom<String> for Interval {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_str().to_string()
    }
}

// =============================================================================
// Lifecycle states
// =============================================================================

/// Per-symbol lifecycle of the price feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Idle,
    Connecting,
    Live,
    /// Transport lost after data arrived; last value is still shown.
    Degraded,
    Closed,
}

impl Default for FeedState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Live => write!(f, "live"),
            Self::Degraded => write!(f, "degraded"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Transport status of a single stream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_concatenated_symbol() {
        let spec = SymbolSpec::parse("btcusdt").unwrap();
        assert_eq!(spec.base, "BTC");
        assert_eq!(spec.quote, "USDT");
        assert_eq!(spec.exchange_symbol(), "BTCUSDT");
        assert_eq!(spec.stream_name(), "btcusdt");
    }

    #[test]
    fn parse_prefers_longest_quote() {
        let spec = SymbolSpec::parse("BTCFDUSD").unwrap();
        assert_eq!(spec.base, "BTC");
        assert_eq!(spec.quote, "FDUSD");

        let spec = SymbolSpec::parse("ETHBTC").unwrap();
        assert_eq!(spec.base, "ETH");
        assert_eq!(spec.quote, "BTC");
    }

    #[test]
    fn parse_separated_forms() {
        for raw in ["SOL/USDT", "sol-usdt", "SOL_USDT", " sol/usdt "] {
            let spec: SymbolSpec = raw.parse().unwrap();
            assert_eq!(spec.symbol, "SOLUSDT", "input {raw}");
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SymbolSpec::parse("").is_err());
        assert!(SymbolSpec::parse("USDT").is_err());
        assert!(SymbolSpec::parse("XYZ").is_err());
        assert!(SymbolSpec::parse("BT C/USDT").is_err());
    }

    #[test]
    fn interval_parse_and_width() {
        assert_eq!("15m".parse::<Interval>().unwrap(), Interval::M15);
        assert_eq!("1H".parse::<Interval>().unwrap(), Interval::H1);
        assert_eq!(Interval::H4.duration_ms(), 14_400_000);
        assert!("1M".parse::<Interval>().is_err());
        assert!("7m".parse::<Interval>().is_err());
    }

    #[test]
    fn bucket_start_floors() {
        let iv = Interval::M1;
        assert_eq!(iv.bucket_start(1_700_000_059_999), 1_700_000_040_000);
        assert_eq!(iv.bucket_start(120_000), 120_000);
        assert_eq!(iv.bucket_start(-1), -60_000);
    }

    #[test]
    fn weekly_buckets_open_on_monday() {
        // Monday 2023-11-13 00:00 UTC.
        let monday = 1_699_833_600_000;
        let day = 86_400_000;
        let iv = Interval::W1;
        assert_eq!(iv.bucket_start(monday), monday);
        assert_eq!(iv.bucket_start(monday + day + day / 2), monday);
        assert_eq!(iv.bucket_start(monday + 7 * day - 1), monday);
        assert_eq!(iv.bucket_start(monday + 7 * day), monday + 7 * day);
        assert_eq!(iv.bucket_start(monday - 1), monday - 7 * day);
        // 3d bars stay aligned to the epoch.
        assert_eq!(Interval::D3.bucket_start(3 * day + 5), 3 * day);
    }

    #[test]
    fn interval_serde_as_string() {
        let json = serde_json::to_string(&Interval::M5).unwrap();
        assert_eq!(json, "\"5m\"");
        let iv: Interval = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(iv, Interval::D1);
    }
}
