// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   k      = 2 / (period + 1)
//   EMA_t  = close_t * k + EMA_{t-1} * (1 - k)
//
// The series is seeded by the first close, so every candle has a value.
// Values stay unrounded f64; rounding happens only at render time.
// =============================================================================

/// Smoothing factor for `period`; `None` for a zero period.
pub fn smoothing(period: usize) -> Option<f64> {
    if period == 0 {
        return None;
    }
    Some(2.0 / (period as f64 + 1.0))
}

/// One step of the recurrence.
pub fn ema_step(prev: f64, close: f64, k: f64) -> f64 {
    close * k + prev * (1.0 - k)
}

/// Full EMA series aligned one-to-one with `closes`.
///
/// Returns an all-`None` series for `period == 0`.  A non-finite close yields
/// `None` at that index and the recurrence continues from the last good value.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut series = EmaSeries::new(period);
    series.rebuild(closes);
    series.values().to_vec()
}

/// Incrementally maintained EMA aligned to a candle sequence whose last
/// element may still change.
#[derive(Debug, Clone)]
pub struct EmaSeries {
    period: usize,
    k: Option<f64>,
    values: Vec<Option<f64>>,
}

impl EmaSeries {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            k: smoothing(period),
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
        self.values.clear();
    }

    /// Forget the oldest `n` points; later values are unaffected.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.values.len());
        self.values.drain(..n);
    }

    /// Replay the whole recurrence over `closes`.
    pub fn rebuild(&mut self, closes: &[f64]) {
        self.values.clear();
        self.values.reserve(closes.len());
        for &close in closes {
            self.push(close);
        }
    }

    /// Extend the series for a newly appended candle.
    pub fn push(&mut self, close: f64) {
        let value = self.next_value(self.values.len(), close);
        self.values.push(value);
    }

    /// Recompute the final point after the open candle's close moved.
    pub fn update_last(&mut self, close: f64) {
        if self.values.is_empty() {
            self.push(close);
            return;
        }
        let idx = self.values.len() - 1;
        let value = self.next_value(idx, close);
        self.values[idx] = value;
    }

    fn next_value(&self, idx: usize, close: f64) -> Option<f64> {
        let k = self.k?;
        if !close.is_finite() {
            return None;
        }
        let prev = self.values[..idx].iter().rev().find_map(|v| *v);
        match prev {
            Some(p) => {
                let ema = ema_step(p, close, k);
                ema.is_finite().then_some(ema)
            }
            None => Some(close),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Option<f64>, b: f64) {
        let a = a.expect("value present");
        assert!((a - b).abs() < 1e-10, "got {a}, expected {b}");
    }

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero_is_all_none() {
        let ema = calculate_ema(&[1.0, 2.0, 3.0], 0);
        assert_eq!(ema, vec![None, None, None]);
    }

    #[test]
    fn ema_seeded_by_first_close() {
        let ema = calculate_ema(&[10.0], 9);
        assert_close(ema[0], 10.0);
    }

    #[test]
    fn ema_known_values() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), closes.len());

        let k = 2.0 / 6.0;
        let mut expected = closes[0];
        assert_close(ema[0], expected);
        for (i, &c) in closes.iter().enumerate().skip(1) {
            expected = c * k + expected * (1.0 - k);
            assert_close(ema[i], expected);
        }
    }

    #[test]
    fn incremental_matches_replay() {
        let mut series = EmaSeries::new(3);
        series.push(10.0);
        series.push(11.0);
        // Open candle ticks move the close several times.
        series.update_last(12.0);
        series.update_last(11.5);
        series.push(13.0);

        let replay = calculate_ema(&[10.0, 11.5, 13.0], 3);
        for (a, b) in series.values().iter().zip(replay.iter()) {
            assert_close(*a, b.unwrap());
        }
    }

    #[test]
    fn non_finite_close_skips_point() {
        let ema = calculate_ema(&[2.0, f64::NAN, 4.0], 1);
        // k = 1 means the EMA equals the latest good close.
        assert_close(ema[0], 2.0);
        assert_eq!(ema[1], None);
        assert_close(ema[2], 4.0);
    }
}
