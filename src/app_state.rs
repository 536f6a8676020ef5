// =============================================================================
// Central Application State
// =============================================================================
//
// Owns the three streaming managers and the caches they share, and ties them
// together behind one selection (symbol + interval).  The API layer reads
// consumer outputs from here and funnels the only inbound command, a
// selection change, through `select`.
//
// Thread safety:
//   - Managers are actors; their outputs are read from watch channels.
//   - parking_lot::RwLock for the current selection (never held across await).
//   - A tokio mutex serialises selection changes so the fan-out to the
//     managers happens in request order.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binance::rate_limit::WeightSnapshot;
use crate::binance::{BinanceClient, MarketRest, WeightTracker};
use crate::market_data::{
    CandleAggregator, CandleSnapshot, OrderBookSnapshot, OrderBookStreamManager, OrderBookTop,
    PriceCache, PriceFeedDeps, PriceSnapshot, PriceStreamManager,
};
use crate::precision::{compact_number, format_amount, format_price, PrecisionCache, PrecisionSpec};
use crate::runtime_config::FeedConfig;
use crate::types::{Interval, SymbolSpec};

// =============================================================================
// Selection
// =============================================================================

/// The symbol/interval every feed is currently following.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub symbol: Option<SymbolSpec>,
    pub interval: Interval,
}

/// Body of `POST /api/v1/selection`.  Omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectionRequest {
    pub symbol: Option<String>,
    pub interval: Option<String>,
}

// =============================================================================
// Snapshot types
// =============================================================================

/// Order-book top rendered with the symbol's precision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookDisplay {
    pub bid_price: String,
    pub bid_qty: String,
    pub ask_price: String,
    pub ask_qty: String,
    pub spread: String,
    /// Quote value resting at the best bid, compacted (`1.23M`).
    pub bid_notional: String,
    pub ask_notional: String,
}

/// Combined payload for `GET /api/v1/state` style reads and the WS push.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub selection: Selection,
    pub precision: Option<PrecisionSpec>,
    pub price: PriceSnapshot,
    pub candles: CandleSnapshot,
    pub orderbook: OrderBookSnapshot,
    pub book_display: Option<BookDisplay>,
    pub rest_weight: WeightSnapshot,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Bumped on every selection change.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: FeedConfig,

    // ── Shared caches ───────────────────────────────────────────────────
    pub precision: Arc<PrecisionCache>,
    pub prices: Arc<PriceCache>,
    pub weights: Arc<WeightTracker>,

    // ── Market Data ─────────────────────────────────────────────────────
    pub price_feed: PriceStreamManager,
    pub candles: CandleAggregator,
    pub orderbook: OrderBookStreamManager,

    // ── Selection ───────────────────────────────────────────────────────
    selection: RwLock<Selection>,
    select_gate: tokio::sync::Mutex<()>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build state against the live exchange REST API.  Must be called from
    /// inside a tokio runtime: the managers spawn their actors immediately.
    pub fn new(config: FeedConfig) -> Result<Self> {
        let client = BinanceClient::new(config.rest_base_url.clone())
            .context("failed to build exchange REST client")?;
        let weights = client.weights().clone();
        Ok(Self::with_rest(config, Arc::new(client), weights))
    }

    /// Build state over any REST implementation.
    pub fn with_rest(
        config: FeedConfig,
        rest: Arc<dyn MarketRest>,
        weights: Arc<WeightTracker>,
    ) -> Self {
        let precision = Arc::new(PrecisionCache::new());
        let prices = Arc::new(PriceCache::new());

        let price_feed = PriceStreamManager::spawn(
            config.price_settings(),
            PriceFeedDeps {
                rest: rest.clone(),
                precision: precision.clone(),
                prices: prices.clone(),
            },
        );
        let candles = CandleAggregator::spawn(config.candle_settings(), rest);
        let orderbook = OrderBookStreamManager::spawn(config.orderbook_settings());

        let selection = Selection {
            symbol: None,
            interval: config.default_interval,
        };

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            config,
            precision,
            prices,
            weights,
            price_feed,
            candles,
            orderbook,
            selection: RwLock::new(selection),
            select_gate: tokio::sync::Mutex::new(()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Selection ───────────────────────────────────────────────────────

    pub fn selection(&self) -> Selection {
        self.selection.read().clone()
    }

    /// Apply a selection change and fan it out to the managers that care.
    ///
    /// A symbol change reaches all three feeds; an interval change only the
    /// candle aggregator.  Re-selecting the current values is a no-op.
    ///
    /// If a manager refuses the change after another already switched, the
    /// new selection is still recorded (it is what the switched feeds now
    /// follow) and the error names the managers that did switch.
    pub async fn select(&self, req: SelectionRequest) -> Result<Selection> {
        let _gate = self.select_gate.lock().await;
        let current = self.selection();

        let symbol = match req.symbol.as_deref() {
            Some(raw) => Some(SymbolSpec::parse(raw)?),
            None => current.symbol.clone(),
        };
        let interval = match req.interval.as_deref() {
            Some(raw) => raw.parse::<Interval>()?,
            None => current.interval,
        };
        let Some(symbol) = symbol else {
            bail!("no symbol selected");
        };

        let symbol_changed = current.symbol.as_ref() != Some(&symbol);
        let interval_changed = current.interval != interval;

        let mut switched: Vec<&'static str> = Vec::new();
        let fan_out: Result<()> = async {
            if symbol_changed {
                self.price_feed.set_symbol(symbol.clone()).await?;
                switched.push("price");
                self.orderbook.set_symbol(&symbol).await?;
                switched.push("orderbook");
            }
            if symbol_changed || interval_changed {
                self.candles.select(symbol.clone(), interval).await?;
                switched.push("candles");
            }
            Ok(())
        }
        .await;

        let next = Selection {
            symbol: Some(symbol),
            interval,
        };
        match fan_out {
            Ok(()) => {
                if symbol_changed || interval_changed {
                    self.commit_selection(&next);
                }
                Ok(next)
            }
            Err(e) if switched.is_empty() => Err(e.context("selection not applied")),
            Err(e) => {
                warn!(
                    switched = ?switched,
                    error = %e,
                    "selection only partly applied"
                );
                self.commit_selection(&next);
                Err(e.context(format!(
                    "selection only partly applied (switched: {})",
                    switched.join(", ")
                )))
            }
        }
    }

    fn commit_selection(&self, next: &Selection) {
        *self.selection.write() = next.clone();
        self.increment_version();
        info!(
            symbol = %next.symbol.as_ref().map(|s| s.exchange_symbol()).unwrap_or_default(),
            interval = %next.interval,
            "selection changed"
        );
    }

    /// Stop every manager; the order book unsubscribes before its socket
    /// closes.
    pub async fn shutdown(&self) {
        self.orderbook.shutdown().await;
        self.price_feed.shutdown().await;
        self.candles.shutdown().await;
        info!("market feeds stopped");
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    pub fn build_snapshot(&self) -> FeedSnapshot {
        let selection = self.selection();
        let precision = selection
            .symbol
            .as_ref()
            .and_then(|s| self.precision.get(s.exchange_symbol()));

        let orderbook = self.orderbook.snapshot();
        let book_display = self.book_display(&orderbook);

        FeedSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            selection,
            precision,
            price: self.price_feed.snapshot(),
            candles: self.candles.snapshot(),
            orderbook,
            book_display,
            rest_weight: self.weights.snapshot(),
        }
    }

    /// Precision-formatted view of the book's top, if there is one.
    pub fn book_display(&self, book: &OrderBookSnapshot) -> Option<BookDisplay> {
        book.data.as_ref().map(|top| {
            let spec = self.precision.get(&top.symbol);
            self.render_book(top, spec.as_ref())
        })
    }

    fn render_book(&self, top: &OrderBookTop, spec: Option<&PrecisionSpec>) -> BookDisplay {
        let price_places = self.config.fallback_price_decimals;
        let amount_places = self.config.fallback_amount_decimals;
        BookDisplay {
            bid_price: format_price(Some(top.bid.price), spec, price_places),
            bid_qty: format_amount(Some(top.bid.qty), spec, amount_places),
            ask_price: format_price(Some(top.ask.price), spec, price_places),
            ask_qty: format_amount(Some(top.ask.qty), spec, amount_places),
            spread: format_price(Some(top.spread()), spec, price_places),
            bid_notional: compact_number(Some(top.bid.price * top.bid.qty)),
            ask_notional: compact_number(Some(top.ask.price * top.ask.qty)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::testing::FakeRest;
    use crate::market_data::BookLevel;

    fn state_with(rest: Arc<FakeRest>) -> AppState {
        let config = FeedConfig {
            ws_base_url: "ws://127.0.0.1:9".to_string(),
            ..FeedConfig::default()
        };
        AppState::with_rest(config, rest, Arc::new(WeightTracker::new()))
    }

    fn request(symbol: Option<&str>, interval: Option<&str>) -> SelectionRequest {
        SelectionRequest {
            symbol: symbol.map(str::to_string),
            interval: interval.map(str::to_string),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn select_requires_a_symbol() {
        let state = state_with(Arc::new(FakeRest::default()));
        assert!(state.select(request(None, Some("5m"))).await.is_err());
        assert_eq!(state.selection().symbol, None);
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn select_rejects_bad_input_without_changing_selection() {
        let state = state_with(Arc::new(FakeRest::default()));
        state.select(request(Some("BTCUSDT"), None)).await.unwrap();

        assert!(state.select(request(None, Some("1M"))).await.is_err());
        assert!(state.select(request(Some(""), None)).await.is_err());

        let sel = state.selection();
        assert_eq!(sel.symbol.unwrap().exchange_symbol(), "BTCUSDT");
        assert_eq!(sel.interval, Interval::M1);
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_only_change_keeps_symbol() {
        let state = state_with(Arc::new(FakeRest::default()));
        state.select(request(Some("eth/usdt"), None)).await.unwrap();
        let v = state.current_state_version();

        let sel = state.select(request(None, Some("15m"))).await.unwrap();
        assert_eq!(sel.symbol.unwrap().exchange_symbol(), "ETHUSDT");
        assert_eq!(sel.interval, Interval::M15);
        assert_eq!(state.current_state_version(), v + 1);

        // Same values again: nothing to do.
        state.select(request(Some("ETHUSDT"), Some("15m"))).await.unwrap();
        assert_eq!(state.current_state_version(), v + 1);
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn book_display_uses_cached_precision() {
        let state = state_with(Arc::new(FakeRest::default()));
        let top = OrderBookTop {
            symbol: "BTCUSDT".to_string(),
            bid: BookLevel { price: 37000.129, qty: 1.5 },
            ask: BookLevel { price: 37000.5, qty: 40.0 },
            ts: 0,
        };

        let fallback = state.render_book(&top, None);
        assert_eq!(fallback.bid_price, "37,000.12");
        assert_eq!(fallback.bid_qty, "1.500000");

        let spec = crate::precision::derive_precision(0.1, 0.001);
        let shown = state.render_book(&top, Some(&spec));
        assert_eq!(shown.bid_price, "37,000.1");
        assert_eq!(shown.ask_qty, "40.000");
        assert_eq!(shown.ask_notional, "1.48M");
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn book_display_reads_precision_for_the_book_symbol() {
        let state = state_with(Arc::new(FakeRest::default()));
        assert!(state.book_display(&OrderBookSnapshot::default()).is_none());

        state
            .precision
            .insert("ETHUSDT", crate::precision::derive_precision(0.01, 0.0001));
        let book = OrderBookSnapshot {
            data: Some(OrderBookTop {
                symbol: "ETHUSDT".to_string(),
                bid: BookLevel { price: 2000.123, qty: 2.0 },
                ask: BookLevel { price: 2000.5, qty: 1.0 },
                ts: 0,
            }),
            ..OrderBookSnapshot::default()
        };
        let shown = state.book_display(&book).unwrap();
        assert_eq!(shown.bid_price, "2,000.12");
        assert_eq!(shown.bid_qty, "2.0000");
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fan_out_records_selection_and_names_switched_feeds() {
        let state = state_with(Arc::new(FakeRest::default()));
        state.select(request(Some("BTCUSDT"), None)).await.unwrap();
        let v = state.current_state_version();

        state.candles.shutdown().await;
        let err = state
            .select(request(Some("ETHUSDT"), None))
            .await
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("switched: price, orderbook"), "{msg}");
        assert!(msg.contains("candle aggregator has stopped"), "{msg}");

        assert_eq!(state.selection().symbol.unwrap().exchange_symbol(), "ETHUSDT");
        assert_eq!(state.current_state_version(), v + 1);
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_refused_everywhere_leaves_selection_alone() {
        let state = state_with(Arc::new(FakeRest::default()));
        state.select(request(Some("BTCUSDT"), None)).await.unwrap();
        let v = state.current_state_version();

        state.shutdown().await;
        let err = state.select(request(Some("ETHUSDT"), None)).await.unwrap_err();
        assert!(format!("{err:#}").contains("selection not applied"));
        assert_eq!(state.selection().symbol.unwrap().exchange_symbol(), "BTCUSDT");
        assert_eq!(state.current_state_version(), v);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reflects_selection() {
        let state = state_with(Arc::new(FakeRest::default()));
        state.select(request(Some("SOLUSDT"), Some("1h"))).await.unwrap();

        let snap = state.build_snapshot();
        assert_eq!(snap.selection.interval, Interval::H1);
        assert!(snap.precision.is_none());
        assert!(snap.book_display.is_none());
        assert_eq!(snap.rest_weight.used_weight_1m, 0);
        state.shutdown().await;
    }
}
