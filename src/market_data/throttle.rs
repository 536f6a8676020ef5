// =============================================================================
// Leading-edge throttle with a single trailing emission
// =============================================================================
//
// The first value after a quiet period goes out immediately.  Values arriving
// inside the window overwrite one pending slot, and only the newest is
// emitted when the window closes.  Time is passed in by the caller so the
// owning task decides how to sleep until `deadline()`.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            pending: None,
            deadline: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Offer a value.  Returns it back when it may be emitted now; otherwise
    /// it replaces whatever was pending and a deadline is armed.
    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        let ready = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window,
        };

        if ready {
            self.last_emit = Some(now);
            self.pending = None;
            self.deadline = None;
            return Some(value);
        }

        self.pending = Some(value);
        if self.deadline.is_none() {
            let last = self.last_emit.unwrap_or(now);
            self.deadline = Some(last + self.window);
        }
        None
    }

    /// When the trailing emission is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Release the pending value once its deadline has passed.
    pub fn fire(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }
        self.deadline = None;
        let value = self.pending.take()?;
        self.last_emit = Some(now);
        Some(value)
    }

    /// Drop any pending value and forget the last emission.
    pub fn reset(&mut self) {
        self.last_emit = None;
        self.pending = None;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn burst_inside_window_emits_first_and_latest() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(ms(50));
        let mut emitted = Vec::new();

        for (offset, value) in [(0, 1), (10, 2), (30, 3)] {
            if let Some(v) = throttle.offer(value, t0 + ms(offset)) {
                emitted.push((offset, v));
            }
        }
        assert_eq!(emitted, vec![(0, 1)]);
        assert_eq!(throttle.deadline(), Some(t0 + ms(50)));

        // Nothing fires early.
        assert_eq!(throttle.fire(t0 + ms(49)), None);
        if let Some(v) = throttle.fire(t0 + ms(50)) {
            emitted.push((50, v));
        }
        assert_eq!(emitted, vec![(0, 1), (50, 3)]);
        assert!(!throttle.has_pending());
    }

    #[test]
    fn late_timer_still_yields_two_emissions() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(ms(50));
        assert_eq!(throttle.offer(1, t0), Some(1));
        assert_eq!(throttle.offer(2, t0 + ms(10)), None);
        assert_eq!(throttle.offer(3, t0 + ms(30)), None);

        // A value arriving after the window supersedes the pending one.
        assert_eq!(throttle.offer(4, t0 + ms(60)), Some(4));
        assert_eq!(throttle.deadline(), None);
        assert_eq!(throttle.fire(t0 + ms(70)), None);
    }

    #[test]
    fn on_time_timer_emits_value_current_at_window_close() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(ms(25));
        let mut emitted = Vec::new();

        // Drive it the way the owning task does: a due deadline fires before
        // the next value is offered.
        for offset in [0u64, 10, 20, 30] {
            let now = t0 + ms(offset);
            if let Some(deadline) = throttle.deadline() {
                if deadline <= now {
                    let at = deadline.duration_since(t0).as_millis() as u64;
                    if let Some(v) = throttle.fire(deadline) {
                        emitted.push((at, v));
                    }
                }
            }
            if let Some(v) = throttle.offer(offset, now) {
                emitted.push((offset, v));
            }
        }
        assert_eq!(emitted, vec![(0, 0), (25, 20)]);

        // The t=30 value waits for the next window.
        assert!(throttle.has_pending());
        assert_eq!(throttle.deadline(), Some(t0 + ms(50)));
        assert_eq!(throttle.fire(t0 + ms(50)), Some(30));
    }

    #[test]
    fn spaced_values_pass_through() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(ms(50));
        assert_eq!(throttle.offer("a", t0), Some("a"));
        assert_eq!(throttle.offer("b", t0 + ms(50)), Some("b"));
        assert_eq!(throttle.offer("c", t0 + ms(120)), Some("c"));
    }

    #[test]
    fn zero_window_never_buffers() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::ZERO);
        assert_eq!(throttle.offer(1, t0), Some(1));
        assert_eq!(throttle.offer(2, t0), Some(2));
    }

    #[test]
    fn reset_discards_pending() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(ms(50));
        throttle.offer(1, t0);
        throttle.offer(2, t0 + ms(5));
        throttle.reset();
        assert_eq!(throttle.fire(t0 + ms(100)), None);
        assert_eq!(throttle.offer(3, t0 + ms(6)), Some(3));
    }
}
