// =============================================================================
// Candle series: history seed + live trade aggregation
// =============================================================================
//
// Trades are folded into fixed-width time buckets.  The last candle is the
// open one and is mutated in place until a trade from a later bucket rolls it
// over.  Volume bars and SMA/EMA overlays stay index-aligned with the candles
// at all times.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::wire::TradeTick;
use crate::indicators::Overlays;
use crate::types::Interval;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLCV bar.  `volume` is base quantity, `quote_volume` is
/// sum(price * qty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

impl Candle {
    /// A candle opened by a single trade.
    pub fn from_trade(open_time: i64, interval: Interval, price: f64, qty: f64) -> Self {
        Self {
            open_time,
            close_time: open_time + interval.duration_ms() - 1,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: qty,
            quote_volume: price * qty,
        }
    }

    /// A zero-volume bar carrying the previous close through an empty bucket.
    pub fn flat(open_time: i64, interval: Interval, price: f64) -> Self {
        Self {
            volume: 0.0,
            quote_volume: 0.0,
            ..Self::from_trade(open_time, interval, price, 0.0)
        }
    }

    pub fn apply_trade(&mut self, price: f64, qty: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += qty;
        self.quote_volume += price * qty;
    }

    pub fn is_rising(&self) -> bool {
        self.close >= self.open
    }
}

/// Identifies one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: Interval,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Histogram point aligned with a candle; colored by candle direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeBar {
    pub open_time: i64,
    /// Quote-asset volume.
    pub value: f64,
    pub rising: bool,
}

impl From<&Candle> for VolumeBar {
    fn from(c: &Candle) -> Self {
        Self {
            open_time: c.open_time,
            value: c.quote_volume,
            rising: c.is_rising(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new bucket was opened (possibly after gap fill).
    Opened,
    /// The open candle absorbed the trade.
    Updated,
    /// The trade belongs to a bucket older than the open one.
    Dropped,
}

// ---------------------------------------------------------------------------
// CandleSeries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CandleSeries {
    interval: Interval,
    candles: Vec<Candle>,
    volumes: Vec<VolumeBar>,
    overlays: Overlays,
    max_candles: usize,
}

impl CandleSeries {
    pub fn new(interval: Interval, sma_period: usize, ema_period: usize, max_candles: usize) -> Self {
        Self {
            interval,
            candles: Vec::new(),
            volumes: Vec::new(),
            overlays: Overlays::new(sma_period, ema_period),
            max_candles: max_candles.max(1),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn volumes(&self) -> &[VolumeBar] {
        &self.volumes
    }

    pub fn sma(&self) -> &[Option<f64>] {
        self.overlays.sma.values()
    }

    pub fn ema(&self) -> &[Option<f64>] {
        self.overlays.ema.values()
    }

    pub fn sma_period(&self) -> usize {
        self.overlays.sma.period()
    }

    pub fn ema_period(&self) -> usize {
        self.overlays.ema.period()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Start of the bucket trades are currently folded into.
    pub fn open_bucket(&self) -> Option<i64> {
        self.candles.last().map(|c| c.open_time)
    }

    pub fn clear(&mut self) {
        self.candles.clear();
        self.volumes.clear();
        self.overlays.clear();
    }

    /// Replace everything with `history` (the newest bar is treated as open).
    pub fn seed(&mut self, mut history: Vec<Candle>) {
        history.sort_by_key(|c| c.open_time);
        history.dedup_by_key(|c| c.open_time);
        let start = history.len().saturating_sub(self.max_candles);

        self.candles = history.split_off(start);
        self.volumes = self.candles.iter().map(VolumeBar::from).collect();
        let closes: Vec<f64> = self.candles.iter().map(|c| c.close).collect();
        self.overlays.rebuild(&closes);

        debug!(
            interval = %self.interval,
            count = self.candles.len(),
            open_bucket = ?self.open_bucket(),
            "candle series seeded"
        );
    }

    /// Fold one trade into the series.
    pub fn apply_trade(&mut self, tick: &TradeTick) -> TickOutcome {
        if !tick.price.is_finite() || tick.price <= 0.0 || !tick.qty.is_finite() {
            return TickOutcome::Dropped;
        }
        let bucket = self.interval.bucket_start(tick.trade_time_ms);

        match self.open_bucket() {
            Some(open) if bucket == open => {
                self.update_open(tick.price, tick.qty);
                TickOutcome::Updated
            }
            Some(open) if bucket < open => {
                trace!(bucket, open, "trade older than open bucket dropped");
                TickOutcome::Dropped
            }
            Some(open) => {
                self.fill_gap(open, bucket);
                self.append(Candle::from_trade(bucket, self.interval, tick.price, tick.qty));
                TickOutcome::Opened
            }
            None => {
                self.append(Candle::from_trade(bucket, self.interval, tick.price, tick.qty));
                TickOutcome::Opened
            }
        }
    }

    fn update_open(&mut self, price: f64, qty: f64) {
        let Some(last) = self.candles.last_mut() else {
            return;
        };
        last.apply_trade(price, qty);
        let bar = VolumeBar::from(&*last);
        if let Some(v) = self.volumes.last_mut() {
            *v = bar;
        }
        self.overlays.on_update_last(price);
    }

    /// Flat bars for every empty bucket strictly between `open` and `next`.
    fn fill_gap(&mut self, open: i64, next: i64) {
        let width = self.interval.duration_ms();
        let Some(prev_close) = self.candles.last().map(|c| c.close) else {
            return;
        };
        let cap = width.saturating_mul(self.max_candles as i64);
        let mut t = (open + width).max(next.saturating_sub(cap));
        let mut filled = 0usize;
        while t < next {
            self.append(Candle::flat(t, self.interval, prev_close));
            t += width;
            filled += 1;
        }
        if filled > 0 {
            debug!(filled, interval = %self.interval, "filled empty buckets");
        }
    }

    fn append(&mut self, candle: Candle) {
        self.overlays.on_append(candle.close);
        self.volumes.push(VolumeBar::from(&candle));
        self.candles.push(candle);

        let excess = self.candles.len().saturating_sub(self.max_candles);
        if excess > 0 {
            self.candles.drain(..excess);
            self.volumes.drain(..excess);
            self.overlays.trim_front(excess);
        }
    }
}
