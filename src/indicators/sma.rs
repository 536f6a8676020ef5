// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================

use std::collections::VecDeque;

/// SMA aligned with `closes`; the first `period - 1` points are `None`.
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut series = SmaSeries::new(period);
    series.rebuild(closes);
    series.values().to_vec()
}

/// Trailing arithmetic mean over the last `period` closes, maintained as the
/// candle sequence grows.  Only the window is kept, so updating the open
/// candle costs O(period).
#[derive(Debug, Clone)]
pub struct SmaSeries {
    period: usize,
    window: VecDeque<f64>,
    values: Vec<Option<f64>>,
}

impl SmaSeries {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            values: Vec::new(),
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn last(&self) -> Option<f64> {
        self.values.last().copied().flatten()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.values.clear();
    }

    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.values.len());
        self.values.drain(..n);
    }

    pub fn rebuild(&mut self, closes: &[f64]) {
        self.clear();
        self.values.reserve(closes.len());
        for &close in closes {
            self.push(close);
        }
    }

    pub fn push(&mut self, close: f64) {
        if self.period > 0 {
            self.window.push_back(close);
            while self.window.len() > self.period {
                self.window.pop_front();
            }
        }
        self.values.push(self.mean());
    }

    /// Replace the newest close in the window and recompute the last point.
    pub fn update_last(&mut self, close: f64) {
        if self.values.is_empty() {
            self.push(close);
            return;
        }
        if let Some(back) = self.window.back_mut() {
            *back = close;
        }
        let mean = self.mean();
        if let Some(v) = self.values.last_mut() {
            *v = mean;
        }
    }

    fn mean(&self) -> Option<f64> {
        if self.period == 0 || self.window.len() < self.period {
            return None;
        }
        let sum: f64 = self.window.iter().sum();
        let mean = sum / self.period as f64;
        mean.is_finite().then_some(mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_warmup_is_none() {
        let sma = calculate_sma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(sma[0], None);
        assert_eq!(sma[1], None);
        assert_eq!(sma[2], Some(2.0));
        assert_eq!(sma[3], Some(3.0));
    }

    #[test]
    fn sma_period_zero_is_all_none() {
        assert_eq!(calculate_sma(&[1.0, 2.0], 0), vec![None, None]);
    }

    #[test]
    fn update_last_tracks_open_candle() {
        let mut series = SmaSeries::new(2);
        series.push(10.0);
        series.push(20.0);
        assert_eq!(series.last(), Some(15.0));

        series.update_last(30.0);
        assert_eq!(series.last(), Some(20.0));
        assert_eq!(series.values().len(), 2);

        series.push(40.0);
        assert_eq!(series.last(), Some(35.0));
    }

    #[test]
    fn update_last_on_empty_pushes() {
        let mut series = SmaSeries::new(1);
        series.update_last(5.0);
        assert_eq!(series.values(), &[Some(5.0)]);
    }
}
