// =============================================================================
// Price Stream Manager: throttled last price for the selected symbol
// =============================================================================
//
// One actor task owns all state.  It runs a ticker stream session for the
// selected symbol plus two one-shot side tasks: the precision lookup and the
// delayed REST fallback.  Every result comes back through one tagged channel,
// and `PriceFeedCore` decides what reaches the published snapshot.
//
// Rules enforced by the core:
//   * results tagged for a previous selection are dropped
//   * the fallback only counts while the stream has produced nothing
//   * published values pass a leading-edge throttle with one trailing emit
//   * losing the transport after data arrived keeps the last value (degraded)
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backoff::ReconnectConfig;
use super::session::{stream_url, SessionEvent, StreamSession};
use super::subscription::{StreamSubscription, SubscriptionTable, SubscriptionTag, Tagged};
use super::throttle::Throttle;
use super::wire::{parse_ticker, TickerUpdate};
use crate::binance::MarketRest;
use crate::cache::SymbolCache;
use crate::precision::{
    decimal_hint, effective_places, format_truncated, load_precision, PrecisionCache, PrecisionSpec,
    MISSING_VALUE,
};
use crate::types::{FeedState, StreamStatus, SymbolSpec};

/// Last known price per symbol, written only by the manager that owns the
/// symbol's subscription.
pub type PriceCache = SymbolCache<PricePoint>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub value: f64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Stream,
    Fallback,
}

/// What consumers of the price feed see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: Option<String>,
    /// Display-ready price string, truncated to `decimal_places`.
    pub price: String,
    pub numeric_price: Option<f64>,
    pub is_loading: bool,
    pub decimal_places: u32,
    pub state: FeedState,
    pub source: Option<PriceSource>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub volume_24h: Option<f64>,
    pub quote_volume_24h: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriceSnapshot {
    pub fn idle(decimal_places: u32) -> Self {
        Self {
            symbol: None,
            price: MISSING_VALUE.to_string(),
            numeric_price: None,
            is_loading: false,
            decimal_places,
            state: FeedState::Idle,
            source: None,
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            quote_volume_24h: None,
            updated_at: None,
        }
    }

    fn loading(symbol: &str, decimal_places: u32) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            is_loading: true,
            state: FeedState::Connecting,
            ..Self::idle(decimal_places)
        }
    }
}

/// Everything that can reach the price actor from a side task.
#[derive(Debug, Clone)]
pub enum PriceEvent {
    Stream(SessionEvent<TickerUpdate>),
    Fallback(String),
    Precision(PrecisionSpec),
}

/// A candidate value waiting on the throttle.
#[derive(Debug, Clone)]
struct RawPrice {
    value: f64,
    text: String,
    source: PriceSource,
    stats: Option<TickerUpdate>,
    received_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Core state machine (no I/O)
// ---------------------------------------------------------------------------

pub struct PriceFeedCore {
    table: SubscriptionTable,
    throttle: Throttle<RawPrice>,
    snapshot: PriceSnapshot,
    precision: Option<PrecisionSpec>,
    fallback_places: u32,
    push_seen: bool,
    last_raw: Option<RawPrice>,
}

impl PriceFeedCore {
    pub fn new(throttle_window: Duration, fallback_places: u32) -> Self {
        Self {
            table: SubscriptionTable::new(),
            throttle: Throttle::new(throttle_window),
            snapshot: PriceSnapshot::idle(fallback_places),
            precision: None,
            fallback_places,
            push_seen: false,
            last_raw: None,
        }
    }

    pub fn snapshot(&self) -> &PriceSnapshot {
        &self.snapshot
    }

    pub fn active(&self) -> Option<&StreamSubscription> {
        self.table.active()
    }

    pub fn push_seen(&self) -> bool {
        self.push_seen
    }

    pub fn has_precision(&self) -> bool {
        self.precision.is_some()
    }

    /// Switch to `symbol`.  Returns `None` when it is already selected,
    /// otherwise the new tag and the retired subscription.
    pub fn select(
        &mut self,
        symbol: &SymbolSpec,
        cached_precision: Option<PrecisionSpec>,
    ) -> Option<(SubscriptionTag, Option<StreamSubscription>)> {
        if self.table.active_key() == Some(symbol.exchange_symbol()) {
            return None;
        }
        let (tag, retired) = self.table.activate(symbol.exchange_symbol());

        self.throttle.reset();
        self.precision = cached_precision;
        self.push_seen = false;
        self.last_raw = None;
        self.snapshot = PriceSnapshot::loading(symbol.exchange_symbol(), self.cached_places());
        Some((tag, retired))
    }

    /// Stop the feed entirely.
    pub fn close(&mut self) -> Option<StreamSubscription> {
        let retired = self.table.retire();
        self.throttle.reset();
        self.snapshot.state = FeedState::Closed;
        self.snapshot.is_loading = false;
        retired
    }

    /// Apply one tagged result.  Returns true when the snapshot changed.
    pub fn on_event(&mut self, tagged: Tagged<PriceEvent>, now: Instant) -> bool {
        if !self.table.is_current(&tagged.tag) {
            debug!(tag = %tagged.tag, "discarding result for stale subscription");
            return false;
        }

        match tagged.event {
            PriceEvent::Stream(SessionEvent::Status(status)) => {
                self.table.set_status(&tagged.tag, status);
                self.on_status(status)
            }
            PriceEvent::Stream(SessionEvent::Message(update)) => {
                if update
                    .symbol
                    .as_deref()
                    .is_some_and(|s| Some(s) != self.table.active_key())
                {
                    debug!(symbol = ?update.symbol, "ticker for another symbol ignored");
                    return false;
                }
                self.push_seen = true;
                let raw = RawPrice {
                    value: update.price,
                    text: update.price_text.clone(),
                    source: PriceSource::Stream,
                    stats: Some(update),
                    received_at: Utc::now(),
                };
                let state_changed = self.snapshot.state != FeedState::Live && self.last_raw.is_some();
                if state_changed {
                    self.snapshot.state = FeedState::Live;
                }
                self.offer(raw, now) || state_changed
            }
            PriceEvent::Fallback(text) => {
                if self.push_seen || self.last_raw.is_some() {
                    debug!("fallback price superseded by stream");
                    return false;
                }
                let value = match text.trim().parse::<f64>() {
                    Ok(v) if v.is_finite() && v > 0.0 => v,
                    _ => {
                        warn!(price = %text, "fallback price is not a positive number");
                        return false;
                    }
                };
                let raw = RawPrice {
                    value,
                    text,
                    source: PriceSource::Fallback,
                    stats: None,
                    received_at: Utc::now(),
                };
                self.offer(raw, now)
            }
            PriceEvent::Precision(spec) => {
                self.precision = Some(spec);
                match self.last_raw.clone() {
                    Some(raw) => {
                        self.render(&raw);
                        true
                    }
                    None => {
                        let places = self.cached_places();
                        let changed = self.snapshot.decimal_places != places;
                        self.snapshot.decimal_places = places;
                        changed
                    }
                }
            }
        }
    }

    /// When the trailing throttle emission is due.
    pub fn deadline(&self) -> Option<Instant> {
        self.throttle.deadline()
    }

    pub fn on_timer(&mut self, now: Instant) -> bool {
        match self.throttle.fire(now) {
            Some(raw) => {
                self.apply(raw);
                true
            }
            None => false,
        }
    }

    /// Point to write into the shared price cache, if any value is shown.
    pub fn last_point(&self) -> Option<PricePoint> {
        let raw = self.last_raw.as_ref()?;
        Some(PricePoint {
            symbol: self.table.active_key()?.to_string(),
            value: raw.value,
            received_at: raw.received_at,
        })
    }

    fn on_status(&mut self, status: StreamStatus) -> bool {
        let has_value = self.last_raw.is_some();
        let next = match (status, has_value) {
            (StreamStatus::Connected, true) => FeedState::Live,
            (StreamStatus::Disconnected | StreamStatus::Connecting, true) => FeedState::Degraded,
            (_, false) => FeedState::Connecting,
            (StreamStatus::Idle, true) => self.snapshot.state,
        };
        if next == self.snapshot.state {
            return false;
        }
        info!(from = %self.snapshot.state, to = %next, symbol = ?self.table.active_key(), "price feed state");
        self.snapshot.state = next;
        true
    }

    fn offer(&mut self, raw: RawPrice, now: Instant) -> bool {
        match self.throttle.offer(raw, now) {
            Some(raw) => {
                self.apply(raw);
                true
            }
            None => false,
        }
    }

    fn apply(&mut self, raw: RawPrice) {
        if raw.source == PriceSource::Stream || self.snapshot.state != FeedState::Degraded {
            self.snapshot.state = FeedState::Live;
        }
        self.render(&raw);
        self.last_raw = Some(raw);
    }

    fn render(&mut self, raw: &RawPrice) {
        let places = effective_places(self.cached_places(), decimal_hint(&raw.text));
        let snap = &mut self.snapshot;
        snap.price = format_truncated(Some(raw.value), places);
        snap.numeric_price = Some(raw.value);
        snap.decimal_places = places;
        snap.is_loading = false;
        snap.source = Some(raw.source);
        snap.updated_at = Some(raw.received_at);
        if let Some(stats) = &raw.stats {
            snap.high_24h = stats.high.or(snap.high_24h);
            snap.low_24h = stats.low.or(snap.low_24h);
            snap.volume_24h = stats.volume.or(snap.volume_24h);
            snap.quote_volume_24h = stats.quote_volume.or(snap.quote_volume_24h);
        }
    }

    fn cached_places(&self) -> u32 {
        self.precision
            .map(|p| p.price_places)
            .unwrap_or(self.fallback_places)
    }
}

// ---------------------------------------------------------------------------
// Actor shell
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PriceFeedSettings {
    pub ws_base_url: String,
    pub throttle: Duration,
    pub fallback_delay: Duration,
    pub fallback_places: u32,
    pub reconnect: ReconnectConfig,
}

#[derive(Clone)]
pub struct PriceFeedDeps {
    pub rest: Arc<dyn MarketRest>,
    pub precision: Arc<PrecisionCache>,
    pub prices: Arc<PriceCache>,
}

enum PriceCommand {
    SetSymbol(SymbolSpec),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the price actor.  Dropping it tears down every socket and timer.
pub struct PriceStreamManager {
    cmd_tx: mpsc::Sender<PriceCommand>,
    snapshot_rx: watch::Receiver<PriceSnapshot>,
    root: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PriceStreamManager {
    pub fn spawn(settings: PriceFeedSettings, deps: PriceFeedDeps) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (out, snapshot_rx) = watch::channel(PriceSnapshot::idle(settings.fallback_places));
        let root = CancellationToken::new();

        let actor = PriceActor {
            core: PriceFeedCore::new(settings.throttle, settings.fallback_places),
            settings,
            deps,
            cmd_rx,
            events_tx,
            events_rx,
            out,
            session: None,
            fallback: None,
            root: root.clone(),
        };
        let task = tokio::spawn(actor.run());

        Self {
            cmd_tx,
            snapshot_rx,
            root,
            task: Mutex::new(Some(task)),
        }
    }

    /// Select a symbol.  Re-selecting the current symbol is a no-op.
    pub async fn set_symbol(&self, symbol: SymbolSpec) -> Result<()> {
        self.cmd_tx
            .send(PriceCommand::SetSymbol(symbol))
            .await
            .ok()
            .context("price stream manager has stopped")
    }

    pub fn subscribe(&self) -> watch::Receiver<PriceSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Close the stream, cancel pending work and wait for the actor to exit.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(PriceCommand::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        self.root.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PriceStreamManager {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct PriceActor {
    settings: PriceFeedSettings,
    deps: PriceFeedDeps,
    core: PriceFeedCore,
    cmd_rx: mpsc::Receiver<PriceCommand>,
    events_tx: mpsc::Sender<Tagged<PriceEvent>>,
    events_rx: mpsc::Receiver<Tagged<PriceEvent>>,
    out: watch::Sender<PriceSnapshot>,
    session: Option<CancellationToken>,
    fallback: Option<CancellationToken>,
    root: CancellationToken,
}

impl PriceActor {
    async fn run(mut self) {
        loop {
            let deadline = self.core.deadline();
            tokio::select! {
                _ = self.root.cancelled() => {
                    self.teardown();
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(PriceCommand::SetSymbol(symbol)) => self.switch(symbol),
                    Some(PriceCommand::Shutdown(ack)) => {
                        self.teardown();
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.teardown();
                        return;
                    }
                },
                Some(event) = self.events_rx.recv() => {
                    if self.core.on_event(event, Instant::now()) {
                        self.publish();
                    }
                    if self.core.push_seen() {
                        if let Some(fallback) = self.fallback.take() {
                            fallback.cancel();
                        }
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    if self.core.on_timer(Instant::now()) {
                        self.publish();
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(symbol = %symbol))]
    fn switch(&mut self, symbol: SymbolSpec) {
        let cached = self.deps.precision.get(symbol.exchange_symbol());
        let Some((tag, retired)) = self.core.select(&symbol, cached) else {
            debug!("symbol already selected");
            return;
        };

        if let Some(token) = self.session.take() {
            token.cancel();
        }
        self.fallback = None;
        if let Some(old) = retired {
            self.deps.prices.invalidate(&old.symbol);
            info!(old = %old.symbol, handle = %old.connection_handle, "price subscription closed");
        }
        self.publish();

        let session = self.root.child_token();
        let fallback = session.child_token();
        self.session = Some(session.clone());
        self.fallback = Some(fallback.clone());

        let url = stream_url(&self.settings.ws_base_url, &format!("{}@ticker", symbol.stream_name()));
        info!(url = %url, tag = %tag, "opening price stream");
        StreamSession::new(
            url,
            tag.clone(),
            self.settings.reconnect,
            parse_ticker,
            PriceEvent::Stream,
            self.events_tx.clone(),
            session.clone(),
        )
        .spawn();

        spawn_fallback(
            self.deps.rest.clone(),
            symbol.exchange_symbol().to_string(),
            self.settings.fallback_delay,
            tag.clone(),
            self.events_tx.clone(),
            fallback,
        );

        if !self.core.has_precision() {
            spawn_precision_lookup(
                self.deps.rest.clone(),
                self.deps.precision.clone(),
                symbol.exchange_symbol().to_string(),
                tag,
                self.events_tx.clone(),
                session,
            );
        }
    }

    fn publish(&self) {
        if let Some(point) = self.core.last_point() {
            let symbol = point.symbol.clone();
            self.deps.prices.insert(&symbol, point);
        }
        self.out.send_replace(self.core.snapshot().clone());
    }

    fn teardown(&mut self) {
        if let Some(token) = self.session.take() {
            token.cancel();
        }
        self.fallback = None;
        if let Some(old) = self.core.close() {
            self.deps.prices.invalidate(&old.symbol);
            info!(symbol = %old.symbol, "price stream manager stopped");
        }
        self.out.send_replace(self.core.snapshot().clone());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// After `delay`, fetch the last price over REST unless cancelled first.
fn spawn_fallback(
    rest: Arc<dyn MarketRest>,
    symbol: String,
    delay: Duration,
    tag: SubscriptionTag,
    events: mpsc::Sender<Tagged<PriceEvent>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        debug!(symbol = %symbol, "no stream data yet, requesting fallback price");
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = rest.last_price(&symbol) => r,
        };
        match result {
            Ok(price) => {
                let _ = events.send(Tagged::new(tag, PriceEvent::Fallback(price))).await;
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "fallback price request failed"),
        }
    });
}

fn spawn_precision_lookup(
    rest: Arc<dyn MarketRest>,
    cache: Arc<PrecisionCache>,
    symbol: String,
    tag: SubscriptionTag,
    events: mpsc::Sender<Tagged<PriceEvent>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = load_precision(&cache, rest.as_ref(), &symbol) => r,
        };
        // Failure leaves the fallback places in effect.
        if let Ok(spec) = result {
            let _ = events.send(Tagged::new(tag, PriceEvent::Precision(spec))).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::testing::FakeRest;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn btc() -> SymbolSpec {
        SymbolSpec::parse("BTCUSDT").unwrap()
    }

    fn eth() -> SymbolSpec {
        SymbolSpec::parse("ETHUSDT").unwrap()
    }

    fn ticker(symbol: &str, price: &str) -> PriceEvent {
        PriceEvent::Stream(SessionEvent::Message(TickerUpdate {
            symbol: Some(symbol.to_string()),
            price: price.parse().unwrap(),
            price_text: price.to_string(),
            high: Some(1.0),
            low: None,
            volume: None,
            quote_volume: None,
            event_time: None,
        }))
    }

    #[test]
    fn stale_symbol_results_are_discarded() {
        let t0 = Instant::now();
        let mut core = PriceFeedCore::new(ms(0), 2);
        let (tag_a, _) = core.select(&btc(), None).unwrap();
        let (tag_b, retired) = core.select(&eth(), None).unwrap();
        assert_eq!(retired.map(|s| s.symbol), Some("BTCUSDT".to_string()));

        // A's stream frame and fallback both land after the switch.
        assert!(!core.on_event(Tagged::new(tag_a.clone(), ticker("BTCUSDT", "37000.00")), t0));
        assert!(!core.on_event(Tagged::new(tag_a, PriceEvent::Fallback("36999.99".into())), t0));
        assert_eq!(core.snapshot().symbol.as_deref(), Some("ETHUSDT"));
        assert_eq!(core.snapshot().numeric_price, None);
        assert!(core.snapshot().is_loading);

        assert!(core.on_event(Tagged::new(tag_b, ticker("ETHUSDT", "2000.55")), t0));
        assert_eq!(core.snapshot().price, "2,000.55");
        assert!(!core.snapshot().is_loading);
    }

    #[test]
    fn throttle_emits_first_then_latest() {
        let t0 = Instant::now();
        let mut core = PriceFeedCore::new(ms(50), 2);
        let (tag, _) = core.select(&btc(), None).unwrap();

        let mut emitted = Vec::new();
        for (offset, price) in [(0, "100.01"), (10, "100.02"), (30, "100.03")] {
            if core.on_event(Tagged::new(tag.clone(), ticker("BTCUSDT", price)), t0 + ms(offset)) {
                emitted.push(core.snapshot().price.clone());
            }
        }
        assert_eq!(emitted, vec!["100.01"]);
        assert_eq!(core.deadline(), Some(t0 + ms(50)));
        assert!(core.on_timer(t0 + ms(50)));
        assert_eq!(core.snapshot().price, "100.03");
        assert!(!core.on_timer(t0 + ms(100)));
    }

    #[test]
    fn fallback_only_applies_without_push() {
        let t0 = Instant::now();
        let mut core = PriceFeedCore::new(ms(0), 2);
        let (tag, _) = core.select(&btc(), None).unwrap();
        assert!(core.on_event(Tagged::new(tag.clone(), ticker("BTCUSDT", "100.5")), t0));
        assert!(!core.on_event(Tagged::new(tag, PriceEvent::Fallback("99.0".into())), t0));
        assert_eq!(core.snapshot().source, Some(PriceSource::Stream));

        let mut core = PriceFeedCore::new(ms(0), 2);
        let (tag, _) = core.select(&btc(), None).unwrap();
        assert!(core.on_event(Tagged::new(tag.clone(), PriceEvent::Fallback("99.00".into())), t0));
        assert_eq!(core.snapshot().source, Some(PriceSource::Fallback));
        assert_eq!(core.snapshot().price, "99.00");
        // The stream still wins once it shows up.
        assert!(core.on_event(Tagged::new(tag, ticker("BTCUSDT", "100.25")), t0 + ms(1)));
        assert_eq!(core.snapshot().source, Some(PriceSource::Stream));
    }

    #[test]
    fn decimal_places_follow_cache_and_hint() {
        let t0 = Instant::now();
        let spec = crate::precision::derive_precision(0.01, 0.0001);
        let mut core = PriceFeedCore::new(ms(0), 2);
        let (tag, _) = core.select(&btc(), Some(spec)).unwrap();
        core.on_event(Tagged::new(tag.clone(), ticker("BTCUSDT", "0.123456")), t0);
        assert_eq!(core.snapshot().decimal_places, 6);
        assert_eq!(core.snapshot().price, "0.123456");

        core.on_event(Tagged::new(tag, ticker("BTCUSDT", "0.5")), t0 + ms(1));
        assert_eq!(core.snapshot().decimal_places, 2);
        assert_eq!(core.snapshot().price, "0.50");
    }

    #[test]
    fn precision_arrival_rerenders_current_value() {
        let t0 = Instant::now();
        let mut core = PriceFeedCore::new(ms(0), 2);
        let (tag, _) = core.select(&btc(), None).unwrap();
        core.on_event(Tagged::new(tag.clone(), ticker("BTCUSDT", "1.5")), t0);
        assert_eq!(core.snapshot().price, "1.50");

        let spec = crate::precision::derive_precision(0.0001, 1.0);
        assert!(core.on_event(Tagged::new(tag, PriceEvent::Precision(spec)), t0));
        assert_eq!(core.snapshot().price, "1.5000");
    }

    #[test]
    fn transport_loss_keeps_last_value() {
        let t0 = Instant::now();
        let mut core = PriceFeedCore::new(ms(0), 2);
        let (tag, _) = core.select(&btc(), None).unwrap();
        let status = |s| PriceEvent::Stream(SessionEvent::Status(s));

        core.on_event(Tagged::new(tag.clone(), status(StreamStatus::Connected)), t0);
        assert_eq!(core.snapshot().state, FeedState::Connecting);
        core.on_event(Tagged::new(tag.clone(), ticker("BTCUSDT", "42.00")), t0);
        assert_eq!(core.snapshot().state, FeedState::Live);

        assert!(core.on_event(Tagged::new(tag.clone(), status(StreamStatus::Disconnected)), t0));
        assert_eq!(core.snapshot().state, FeedState::Degraded);
        assert_eq!(core.snapshot().price, "42.00");

        core.on_event(Tagged::new(tag, status(StreamStatus::Connected)), t0);
        assert_eq!(core.snapshot().state, FeedState::Live);
    }

    #[test]
    fn reselecting_current_symbol_is_noop() {
        let mut core = PriceFeedCore::new(ms(0), 2);
        assert!(core.select(&btc(), None).is_some());
        assert!(core.select(&btc(), None).is_none());
    }

    fn deps(rest: Arc<FakeRest>) -> PriceFeedDeps {
        PriceFeedDeps {
            rest,
            precision: Arc::new(PrecisionCache::new()),
            prices: Arc::new(PriceCache::new()),
        }
    }

    fn settings() -> PriceFeedSettings {
        PriceFeedSettings {
            // Nothing listens here; the stream never connects.
            ws_base_url: "ws://127.0.0.1:9/ws".into(),
            throttle: ms(0),
            fallback_delay: ms(3000),
            fallback_places: 2,
            reconnect: ReconnectConfig::from_millis(60_000, 60_000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_fills_silent_stream() {
        let rest = Arc::new(FakeRest::default());
        rest.set_price("BTCUSDT", "37123.45");
        rest.set_filters("BTCUSDT", 0.01, 0.00001);
        let deps = deps(rest.clone());
        let prices = deps.prices.clone();

        let manager = PriceStreamManager::spawn(settings(), deps);
        let mut rx = manager.subscribe();
        manager.set_symbol(btc()).await.unwrap();

        let snap = rx
            .wait_for(|s| s.source == Some(PriceSource::Fallback))
            .await
            .unwrap()
            .clone();
        assert_eq!(snap.price, "37,123.45");
        assert_eq!(rest.price_calls(), 1);
        assert!(prices.contains("BTCUSDT"));

        manager.shutdown().await;
        assert_eq!(manager.snapshot().state, FeedState::Closed);
        assert!(!prices.contains("BTCUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_before_fallback_cancels_it() {
        let rest = Arc::new(FakeRest::default());
        rest.set_price("BTCUSDT", "37000.00");
        rest.set_price("ETHUSDT", "2000.00");
        let manager = PriceStreamManager::spawn(settings(), deps(rest.clone()));
        let mut rx = manager.subscribe();

        manager.set_symbol(btc()).await.unwrap();
        tokio::time::sleep(ms(1000)).await;
        manager.set_symbol(eth()).await.unwrap();

        let snap = rx
            .wait_for(|s| s.numeric_price.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(snap.symbol.as_deref(), Some("ETHUSDT"));
        assert_eq!(snap.price, "2,000.00");
        assert_eq!(rest.price_calls(), 1);
        manager.shutdown().await;
    }
}
