// =============================================================================
// Candle Aggregator: history bootstrap + live trades for (symbol, interval)
// =============================================================================
//
// Selecting a new pair clears the series first, then rebuilds it: the trade
// stream opens right away and its ticks are buffered until the REST history
// lands, after which the backlog is replayed on top of the history.  Buffered
// ticks the history already covers (at or before both the response time and
// the last bar's close) are skipped so their volume is not counted twice.
// History and ticks both carry the selection tag, so a slow response for a pair the
// user already left never reaches the series.
// =============================================================================

use std::collections::VecDeque;
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
use super::candles::{Candle, CandleKey, CandleSeries, TickOutcome, VolumeBar};
use super::session::{stream_url, SessionEvent, StreamSession};
use super::subscription::{StreamSubscription, SubscriptionTable, SubscriptionTag, Tagged};
use super::throttle::Throttle;
use super::wire::{parse_trade, TradeTick};
use crate::binance::MarketRest;
use crate::types::{Interval, StreamStatus, SymbolSpec};

/// Ticks kept while history is still loading; the oldest are dropped first.
const MAX_BACKLOG: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub symbol: Option<String>,
    pub interval: Interval,
    pub candles: Vec<Candle>,
    pub volumes: Vec<VolumeBar>,
    pub sma: Vec<Option<f64>>,
    pub ema: Vec<Option<f64>>,
    pub sma_period: usize,
    pub ema_period: usize,
    pub is_loading: bool,
    pub error: Option<String>,
    pub status: StreamStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CandleSnapshot {
    fn empty(interval: Interval, sma_period: usize, ema_period: usize) -> Self {
        Self {
            symbol: None,
            interval,
            candles: Vec::new(),
            volumes: Vec::new(),
            sma: Vec::new(),
            ema: Vec::new(),
            sma_period,
            ema_period,
            is_loading: false,
            error: None,
            status: StreamStatus::Idle,
            updated_at: None,
        }
    }
}

/// REST history for the selection, stamped with when the response arrived.
#[derive(Debug, Clone)]
pub struct HistoryBatch {
    pub result: Result<Vec<Candle>, String>,
    pub fetched_at_ms: i64,
}

#[derive(Debug, Clone)]
pub enum CandleEvent {
    History(HistoryBatch),
    Stream(SessionEvent<TradeTick>),
}

/// How a result affected the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleChange {
    Unchanged,
    /// Tick-level change; published through the throttle.
    Tick,
    /// History, selection or status change; published at once.
    Structural,
}

// ---------------------------------------------------------------------------
// Core state machine (no I/O)
// ---------------------------------------------------------------------------

pub struct CandleFeedCore {
    table: SubscriptionTable,
    key: Option<CandleKey>,
    series: CandleSeries,
    bootstrapped: bool,
    backlog: VecDeque<TradeTick>,
    status: StreamStatus,
    error: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    sma_period: usize,
    ema_period: usize,
    max_candles: usize,
}

impl CandleFeedCore {
    pub fn new(sma_period: usize, ema_period: usize, max_candles: usize) -> Self {
        Self {
            table: SubscriptionTable::new(),
            key: None,
            series: CandleSeries::new(Interval::default(), sma_period, ema_period, max_candles),
            bootstrapped: false,
            backlog: VecDeque::new(),
            status: StreamStatus::Idle,
            error: None,
            updated_at: None,
            sma_period,
            ema_period,
            max_candles,
        }
    }

    pub fn key(&self) -> Option<&CandleKey> {
        self.key.as_ref()
    }

    pub fn series(&self) -> &CandleSeries {
        &self.series
    }

    pub fn is_loading(&self) -> bool {
        self.key.is_some() && !self.bootstrapped
    }

    /// Clear and re-target the series.  `None` when `key` is already active.
    pub fn select(&mut self, key: CandleKey) -> Option<(SubscriptionTag, Option<StreamSubscription>)> {
        if self.key.as_ref() == Some(&key) {
            return None;
        }
        let (tag, retired) = self.table.activate(&key.to_string());
        self.series = CandleSeries::new(key.interval, self.sma_period, self.ema_period, self.max_candles);
        self.key = Some(key);
        self.bootstrapped = false;
        self.backlog.clear();
        self.status = StreamStatus::Connecting;
        self.error = None;
        self.updated_at = None;
        Some((tag, retired))
    }

    pub fn close(&mut self) -> Option<StreamSubscription> {
        let retired = self.table.retire();
        self.key = None;
        self.series.clear();
        self.backlog.clear();
        self.bootstrapped = false;
        self.status = StreamStatus::Idle;
        retired
    }

    pub fn on_event(&mut self, tagged: Tagged<CandleEvent>) -> CandleChange {
        if !self.table.is_current(&tagged.tag) {
            debug!(tag = %tagged.tag, "discarding result for stale candle selection");
            return CandleChange::Unchanged;
        }

        match tagged.event {
            CandleEvent::History(HistoryBatch {
                result: Ok(history),
                fetched_at_ms,
            }) => {
                let covered_until = history
                    .iter()
                    .map(|c| c.close_time)
                    .max()
                    .map(|close| close.min(fetched_at_ms));
                self.series.seed(history);
                self.bootstrap(covered_until);
                CandleChange::Structural
            }
            CandleEvent::History(HistoryBatch { result: Err(e), .. }) => {
                warn!(tag = %tagged.tag, error = %e, "candle history unavailable, continuing live only");
                self.error = Some(e);
                self.bootstrap(None);
                CandleChange::Structural
            }
            CandleEvent::Stream(SessionEvent::Status(status)) => {
                self.table.set_status(&tagged.tag, status);
                if self.status == status {
                    return CandleChange::Unchanged;
                }
                self.status = status;
                CandleChange::Structural
            }
            CandleEvent::Stream(SessionEvent::Message(tick)) => {
                if !self.bootstrapped {
                    if self.backlog.len() >= MAX_BACKLOG {
                        self.backlog.pop_front();
                    }
                    self.backlog.push_back(tick);
                    return CandleChange::Unchanged;
                }
                match self.series.apply_trade(&tick) {
                    TickOutcome::Dropped => CandleChange::Unchanged,
                    TickOutcome::Opened | TickOutcome::Updated => {
                        self.updated_at = Some(Utc::now());
                        CandleChange::Tick
                    }
                }
            }
        }
    }

    /// Replay the backlog onto the seeded series.  Ticks at or before
    /// `covered_until` are already inside the history bars.
    fn bootstrap(&mut self, covered_until: Option<i64>) {
        self.bootstrapped = true;
        let backlog = std::mem::take(&mut self.backlog);
        let buffered = backlog.len();
        let mut skipped = 0usize;
        let mut replayed = 0usize;
        for tick in backlog {
            if covered_until.is_some_and(|t| tick.trade_time_ms <= t) {
                skipped += 1;
                continue;
            }
            if self.series.apply_trade(&tick) != TickOutcome::Dropped {
                replayed += 1;
            }
        }
        if buffered > 0 {
            debug!(buffered, replayed, skipped, "replayed buffered trades");
        }
        self.updated_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> CandleSnapshot {
        let interval = self.key.as_ref().map(|k| k.interval).unwrap_or(self.series.interval());
        CandleSnapshot {
            symbol: self.key.as_ref().map(|k| k.symbol.clone()),
            interval,
            candles: self.series.candles().to_vec(),
            volumes: self.series.volumes().to_vec(),
            sma: self.series.sma().to_vec(),
            ema: self.series.ema().to_vec(),
            sma_period: self.sma_period,
            ema_period: self.ema_period,
            is_loading: self.is_loading(),
            error: self.error.clone(),
            status: self.status,
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Actor shell
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CandleFeedSettings {
    pub ws_base_url: String,
    pub history_limit: u32,
    pub throttle: Duration,
    pub sma_period: usize,
    pub ema_period: usize,
    pub max_candles: usize,
    pub reconnect: ReconnectConfig,
}

enum CandleCommand {
    Select(SymbolSpec, Interval),
    SetSymbol(SymbolSpec),
    SetInterval(Interval),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the candle actor.  Dropping it tears down the stream.
pub struct CandleAggregator {
    cmd_tx: mpsc::Sender<CandleCommand>,
    snapshot_rx: watch::Receiver<CandleSnapshot>,
    root: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CandleAggregator {
    pub fn spawn(settings: CandleFeedSettings, rest: Arc<dyn MarketRest>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (out, snapshot_rx) = watch::channel(CandleSnapshot::empty(
            Interval::default(),
            settings.sma_period,
            settings.ema_period,
        ));
        let root = CancellationToken::new();

        let actor = CandleActor {
            core: CandleFeedCore::new(settings.sma_period, settings.ema_period, settings.max_candles),
            throttle: Throttle::new(settings.throttle),
            settings,
            rest,
            cmd_rx,
            events_tx,
            events_rx,
            out,
            symbol: None,
            interval: Interval::default(),
            session: None,
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

    async fn send(&self, cmd: CandleCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .ok()
            .context("candle aggregator has stopped")
    }

    pub async fn select(&self, symbol: SymbolSpec, interval: Interval) -> Result<()> {
        self.send(CandleCommand::Select(symbol, interval)).await
    }

    /// Change the symbol, keeping the current interval.
    pub async fn set_symbol(&self, symbol: SymbolSpec) -> Result<()> {
        self.send(CandleCommand::SetSymbol(symbol)).await
    }

    /// Change the interval, keeping the current symbol.
    pub async fn set_interval(&self, interval: Interval) -> Result<()> {
        self.send(CandleCommand::SetInterval(interval)).await
    }

    pub fn subscribe(&self) -> watch::Receiver<CandleSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> CandleSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(CandleCommand::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        self.root.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for CandleAggregator {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct CandleActor {
    settings: CandleFeedSettings,
    rest: Arc<dyn MarketRest>,
    core: CandleFeedCore,
    throttle: Throttle<()>,
    cmd_rx: mpsc::Receiver<CandleCommand>,
    events_tx: mpsc::Sender<Tagged<CandleEvent>>,
    events_rx: mpsc::Receiver<Tagged<CandleEvent>>,
    out: watch::Sender<CandleSnapshot>,
    symbol: Option<SymbolSpec>,
    interval: Interval,
    session: Option<CancellationToken>,
    root: CancellationToken,
}

impl CandleActor {
    async fn run(mut self) {
        loop {
            let deadline = self.throttle.deadline();
            tokio::select! {
                _ = self.root.cancelled() => {
                    self.teardown();
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(CandleCommand::Select(symbol, interval)) => {
                        self.interval = interval;
                        self.symbol = Some(symbol);
                        self.switch();
                    }
                    Some(CandleCommand::SetSymbol(symbol)) => {
                        self.symbol = Some(symbol);
                        self.switch();
                    }
                    Some(CandleCommand::SetInterval(interval)) => {
                        self.interval = interval;
                        self.switch();
                    }
                    Some(CandleCommand::Shutdown(ack)) => {
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
                    match self.core.on_event(event) {
                        CandleChange::Unchanged => {}
                        CandleChange::Structural => {
                            self.throttle.reset();
                            self.publish();
                        }
                        CandleChange::Tick => {
                            if self.throttle.offer((), Instant::now()).is_some() {
                                self.publish();
                            }
                        }
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    if self.throttle.fire(Instant::now()).is_some() {
                        self.publish();
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(interval = %self.interval))]
    fn switch(&mut self) {
        let Some(symbol) = self.symbol.clone() else {
            debug!("interval recorded, no symbol selected yet");
            return;
        };
        let key = CandleKey::new(symbol.exchange_symbol(), self.interval);
        let Some((tag, retired)) = self.core.select(key) else {
            debug!(symbol = %symbol, "candle selection unchanged");
            return;
        };

        if let Some(token) = self.session.take() {
            token.cancel();
        }
        if let Some(old) = retired {
            info!(old = %old.symbol, handle = %old.connection_handle, "candle subscription closed");
        }
        // Cleared series goes out before anything from the new pair.
        self.throttle.reset();
        self.publish();

        let session = self.root.child_token();
        self.session = Some(session.clone());

        let url = stream_url(&self.settings.ws_base_url, &format!("{}@trade", symbol.stream_name()));
        info!(url = %url, tag = %tag, "opening trade stream");
        StreamSession::new(
            url,
            tag.clone(),
            self.settings.reconnect,
            parse_trade,
            CandleEvent::Stream,
            self.events_tx.clone(),
            session.clone(),
        )
        .spawn();

        spawn_history(
            self.rest.clone(),
            symbol.exchange_symbol().to_string(),
            self.interval,
            self.settings.history_limit,
            tag,
            self.events_tx.clone(),
            session,
        );
    }

    fn publish(&self) {
        self.out.send_replace(self.core.snapshot());
    }

    fn teardown(&mut self) {
        if let Some(token) = self.session.take() {
            token.cancel();
        }
        self.throttle.reset();
        if let Some(old) = self.core.close() {
            info!(key = %old.symbol, "candle aggregator stopped");
        }
        self.publish();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn spawn_history(
    rest: Arc<dyn MarketRest>,
    symbol: String,
    interval: Interval,
    limit: u32,
    tag: SubscriptionTag,
    events: mpsc::Sender<Tagged<CandleEvent>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = rest.klines(&symbol, interval, limit) => r,
        };
        let event = CandleEvent::History(HistoryBatch {
            result: result.map_err(|e| format!("{e:#}")),
            fetched_at_ms: Utc::now().timestamp_millis(),
        });
        let _ = events.send(Tagged::new(tag, event)).await;
    });
}
