// =============================================================================
// Wire Normalization: every accepted payload shape -> one canonical record
// =============================================================================
//
// Upstream payloads are loose: a price may be `c`, `p`, `price` or
// `lastPrice`, numbers may arrive as strings or JSON numbers, and frames may
// be wrapped in a combined-stream `{ "stream", "data" }` envelope.  Nothing
// past this module looks at raw JSON.
//
// A payload that fails normalization is an error for that single message
// only; callers log and drop it.
// =============================================================================

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized 24h ticker / last-price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub symbol: Option<String>,
    pub price: f64,
    /// Price exactly as sent; its fractional digits feed the precision hint.
    pub price_text: String,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<f64>,
    pub quote_volume: Option<f64>,
    pub event_time: Option<i64>,
}

/// Normalized individual trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: Option<String>,
    pub price: f64,
    pub qty: f64,
    pub trade_time_ms: i64,
}

impl TradeTick {
    pub fn quote_volume(&self) -> f64 {
        self.price * self.qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Best bid/ask for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookTop {
    pub symbol: String,
    pub bid: BookLevel,
    pub ask: BookLevel,
    pub ts: i64,
}

impl OrderBookTop {
    pub fn spread(&self) -> f64 {
        self.ask.price - self.bid.price
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Strip a combined-stream envelope, returning `(stream_name, payload)`.
fn unwrap_envelope(root: &Value) -> (Option<&str>, &Value) {
    match (root.get("stream"), root.get("data")) {
        (Some(stream), Some(data)) => (stream.as_str(), data),
        _ => (None, root),
    }
}

/// First present, non-null field among `names`.
fn field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find(|v| !v.is_null())
}

/// Numeric value from a JSON string or number, required to be finite.
fn as_f64(val: &Value, name: &str) -> Result<f64> {
    let n = match val {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("field {name} is not numeric: {s}"))?,
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        _ => bail!("field {name} has unexpected JSON type"),
    };
    if !n.is_finite() {
        bail!("field {name} is not finite");
    }
    Ok(n)
}

fn as_text(val: &Value) -> Option<String> {
    match val {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_i64(val: &Value, name: &str) -> Result<i64> {
    match val {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .with_context(|| format!("field {name} is not an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .with_context(|| format!("field {name} is not an integer: {s}")),
        _ => bail!("field {name} has unexpected JSON type"),
    }
}

fn optional_f64(obj: &Value, names: &[&str]) -> Option<f64> {
    field(obj, names).and_then(|v| as_f64(v, names[0]).ok())
}

fn symbol_of(obj: &Value, stream: Option<&str>) -> Option<String> {
    field(obj, &["s", "symbol"])
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase)
        .or_else(|| {
            stream
                .and_then(|s| s.split('@').next())
                .filter(|s| !s.is_empty())
                .map(str::to_ascii_uppercase)
        })
}

fn parse_root(text: &str) -> Result<Value> {
    serde_json::from_str(text).context("payload is not valid JSON")
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Normalize a ticker or trade payload into a [`TickerUpdate`].
///
/// Accepted shapes include the 24h ticker (`c`, `h`, `l`, `v`, `q`), the
/// mini/REST ticker (`lastPrice`, `highPrice`, ...), plain `{price}` and
/// trade frames (`p`).
pub fn parse_ticker(text: &str) -> Result<TickerUpdate> {
    let root = parse_root(text)?;
    let (stream, data) = unwrap_envelope(&root);

    // In the 24h ticker `p` is the price *change*, so `c` must win.
    let raw_price = field(data, &["c", "lastPrice", "price", "p"]).context("missing price field")?;
    let price = as_f64(raw_price, "price")?;
    if price <= 0.0 {
        bail!("non-positive price {price}");
    }
    let price_text = as_text(raw_price).context("price is neither string nor number")?;

    let event_time = field(data, &["E", "eventTime", "closeTime"]).and_then(|v| as_i64(v, "E").ok());

    Ok(TickerUpdate {
        symbol: symbol_of(data, stream),
        price,
        price_text,
        high: optional_f64(data, &["h", "highPrice"]),
        low: optional_f64(data, &["l", "lowPrice"]),
        volume: optional_f64(data, &["v", "volume"]),
        quote_volume: optional_f64(data, &["q", "quoteVolume"]),
        event_time,
    })
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// Normalize a `trade` / `aggTrade` payload into a [`TradeTick`].
pub fn parse_trade(text: &str) -> Result<TradeTick> {
    let root = parse_root(text)?;
    let (stream, data) = unwrap_envelope(&root);

    let price = as_f64(field(data, &["p", "price"]).context("missing price field")?, "price")?;
    if price <= 0.0 {
        bail!("non-positive price {price}");
    }
    let qty = as_f64(
        field(data, &["q", "qty", "quantity"]).context("missing quantity field")?,
        "qty",
    )?;
    if qty < 0.0 {
        bail!("negative quantity {qty}");
    }
    let trade_time_ms = as_i64(
        field(data, &["T", "tradeTime", "time", "E"]).context("missing trade time field")?,
        "T",
    )?;

    Ok(TradeTick {
        symbol: symbol_of(data, stream),
        price,
        qty,
        trade_time_ms,
    })
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// Normalize an order-book frame.
///
/// Returns `Ok(None)` for control frames (subscription acknowledgements),
/// `Err` for exchange error frames and malformed payloads.  Frames without a
/// timestamp are stamped with `received_at_ms`.
pub fn parse_book(text: &str, received_at_ms: i64) -> Result<Option<OrderBookTop>> {
    let root = parse_root(text)?;

    if let Some(err) = root.get("error").filter(|e| !e.is_null()) {
        bail!("exchange error frame: {err}");
    }
    if root.get("result").is_some() && root.get("id").is_some() {
        return Ok(None);
    }

    let (stream, data) = unwrap_envelope(&root);
    // Generic `{ "event": "orderbook", "data": {...} }` wrapper.
    let data = match root.get("event").and_then(Value::as_str) {
        Some("orderbook") => root.get("data").unwrap_or(&root),
        Some(other) => bail!("unexpected event '{other}'"),
        None => data,
    };

    let symbol = symbol_of(data, stream).context("missing symbol")?;
    let ts = field(data, &["ts", "E", "T"])
        .and_then(|v| as_i64(v, "ts").ok())
        .unwrap_or(received_at_ms);

    let (bid, ask) = if let (Some(bid), Some(ask)) = (data.get("bid"), data.get("ask")) {
        (parse_level_obj(bid, "bid")?, parse_level_obj(ask, "ask")?)
    } else if data.get("b").is_some() && data.get("a").is_some() && data.get("B").is_some() {
        (
            BookLevel {
                price: as_f64(&data["b"], "b")?,
                qty: as_f64(&data["B"], "B")?,
            },
            BookLevel {
                price: as_f64(&data["a"], "a")?,
                qty: as_f64(&data["A"], "A")?,
            },
        )
    } else if let (Some(bids), Some(asks)) = (
        field(data, &["bids", "b"]).and_then(Value::as_array),
        field(data, &["asks", "a"]).and_then(Value::as_array),
    ) {
        (first_level(bids, "bids")?, first_level(asks, "asks")?)
    } else {
        bail!("no recognisable bid/ask fields");
    };

    Ok(Some(OrderBookTop {
        symbol,
        bid,
        ask,
        ts,
    }))
}

fn parse_level_obj(val: &Value, side: &str) -> Result<BookLevel> {
    Ok(BookLevel {
        price: as_f64(field(val, &["price", "p"]).with_context(|| format!("{side}.price missing"))?, side)?,
        qty: as_f64(
            field(val, &["qty", "quantity", "q", "size"]).with_context(|| format!("{side}.qty missing"))?,
            side,
        )?,
    })
}

/// Best level of a depth array `[["price", "qty"], ...]`.
fn first_level(levels: &[Value], side: &str) -> Result<BookLevel> {
    let level = levels
        .first()
        .and_then(Value::as_array)
        .with_context(|| format!("{side} is empty"))?;
    let price = level.first().with_context(|| format!("{side} level has no price"))?;
    let qty = level.get(1).with_context(|| format!("{side} level has no qty"))?;
    Ok(BookLevel {
        price: as_f64(price, side)?,
        qty: as_f64(qty, side)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_24h_prefers_close_over_change() {
        let json = r#"{
            "e": "24hrTicker", "E": 1700000000123, "s": "BTCUSDT",
            "p": "-120.50", "c": "37020.01000000",
            "h": "37500.00", "l": "36800.00", "v": "1234.5", "q": "45678901.2"
        }"#;
        let t = parse_ticker(json).unwrap();
        assert_eq!(t.symbol.as_deref(), Some("BTCUSDT"));
        assert!((t.price - 37020.01).abs() < 1e-9);
        assert_eq!(t.price_text, "37020.01000000");
        assert_eq!(t.high, Some(37500.0));
        assert_eq!(t.quote_volume, Some(45678901.2));
        assert_eq!(t.event_time, Some(1_700_000_000_123));
    }

    #[test]
    fn ticker_accepts_long_names_and_numbers() {
        let t = parse_ticker(r#"{"symbol":"ethusdt","lastPrice":2000.5,"volume":"10"}"#).unwrap();
        assert_eq!(t.symbol.as_deref(), Some("ETHUSDT"));
        assert_eq!(t.price_text, "2000.5");
        assert_eq!(t.volume, Some(10.0));
        assert_eq!(t.high, None);
    }

    #[test]
    fn ticker_in_combined_envelope() {
        let json = r#"{"stream":"solusdt@ticker","data":{"c":"150.25"}}"#;
        let t = parse_ticker(json).unwrap();
        assert_eq!(t.symbol.as_deref(), Some("SOLUSDT"));
        assert!((t.price - 150.25).abs() < 1e-12);
    }

    #[test]
    fn ticker_rejects_malformed() {
        assert!(parse_ticker("not json").is_err());
        assert!(parse_ticker(r#"{"s":"BTCUSDT"}"#).is_err());
        assert!(parse_ticker(r#"{"c":"abc"}"#).is_err());
        assert!(parse_ticker(r#"{"c":"0"}"#).is_err());
    }

    #[test]
    fn trade_frame() {
        let json = r#"{"e":"trade","E":1700000000500,"s":"BTCUSDT","t":1,"p":"37000.10","q":"0.250","T":1700000000499,"m":true}"#;
        let t = parse_trade(json).unwrap();
        assert_eq!(t.trade_time_ms, 1_700_000_000_499);
        assert!((t.qty - 0.25).abs() < 1e-12);
        assert!((t.quote_volume() - 9250.025).abs() < 1e-6);
    }

    #[test]
    fn trade_missing_time_is_malformed() {
        assert!(parse_trade(r#"{"p":"1.0","q":"2.0"}"#).is_err());
        assert!(parse_trade(r#"{"p":"1.0","q":"-2.0","T":5}"#).is_err());
    }

    #[test]
    fn book_ticker_frame() {
        let json = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;
        let top = parse_book(json, 42).unwrap().unwrap();
        assert_eq!(top.symbol, "BNBUSDT");
        assert!((top.bid.price - 25.3519).abs() < 1e-9);
        assert!((top.ask.qty - 40.66).abs() < 1e-9);
        assert_eq!(top.ts, 42);
        assert!(top.spread() > 0.0);
    }

    #[test]
    fn generic_orderbook_event() {
        let json = r#"{"event":"orderbook","data":{"symbol":"BTCUSDT","bid":{"price":"100.5","qty":"2"},"ask":{"price":101,"qty":1.5},"ts":1700000000000}}"#;
        let top = parse_book(json, 0).unwrap().unwrap();
        assert_eq!(top.ask.price, 101.0);
        assert_eq!(top.ts, 1_700_000_000_000);
    }

    #[test]
    fn depth_frame_takes_symbol_from_stream() {
        let json = r#"{"stream":"ethusdt@depth5","data":{"lastUpdateId":1,"bids":[["2000.1","3"]],"asks":[["2000.2","4"]]}}"#;
        let top = parse_book(json, 7).unwrap().unwrap();
        assert_eq!(top.symbol, "ETHUSDT");
        assert_eq!(top.bid.qty, 3.0);
    }

    #[test]
    fn ack_and_error_frames() {
        assert!(parse_book(r#"{"result":null,"id":3}"#, 0).unwrap().is_none());
        assert!(parse_book(r#"{"error":{"code":2,"msg":"Invalid request"},"id":3}"#, 0).is_err());
        assert!(parse_book(r#"{"s":"BTCUSDT"}"#, 0).is_err());
    }
}
