// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Overlays derived from a candle sequence.  Each series is aligned one-to-one
// with the candles and extended incrementally: appending a candle pushes a
// point, mutating the open candle recomputes only the last point.

pub mod ema;
pub mod sma;

pub use ema::{calculate_ema, EmaSeries};
pub use sma::{calculate_sma, SmaSeries};

/// The SMA + EMA pair drawn over the candles.
#[derive(Debug, Clone)]
pub struct Overlays {
    pub sma: SmaSeries,
    pub ema: EmaSeries,
}

impl Overlays {
    pub fn new(sma_period: usize, ema_period: usize) -> Self {
        Self {
            sma: SmaSeries::new(sma_period),
            ema: EmaSeries::new(ema_period),
        }
    }

    pub fn rebuild(&mut self, closes: &[f64]) {
        self.sma.rebuild(closes);
        self.ema.rebuild(closes);
    }

    pub fn on_append(&mut self, close: f64) {
        self.sma.push(close);
        self.ema.push(close);
    }

    pub fn on_update_last(&mut self, close: f64) {
        self.sma.update_last(close);
        self.ema.update_last(close);
    }

    pub fn trim_front(&mut self, n: usize) {
        self.sma.trim_front(n);
        self.ema.trim_front(n);
    }

    pub fn clear(&mut self) {
        self.sma.clear();
        self.ema.clear();
    }
}
