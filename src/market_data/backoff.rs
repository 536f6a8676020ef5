// =============================================================================
// Reconnect backoff: exponential delay with jitter, retried forever
// =============================================================================

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised in either direction (0.1 = +/-10%).
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ReconnectConfig {
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        let initial_delay = Duration::from_millis(initial_ms.max(1));
        Self {
            initial_delay,
            max_delay: Duration::from_millis(max_ms).max(initial_delay),
            ..Self::default()
        }
    }
}

/// Backoff state for one connection.  Reset after every successful connect.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt; grows geometrically up to `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt_count = self.attempt_count.saturating_add(1);

        let delay = self.apply_jitter(self.current_delay);

        let scaled = self.current_delay.as_secs_f64() * self.config.multiplier;
        let next = if scaled.is_finite() && scaled > 0.0 {
            Duration::from_secs_f64(scaled)
        } else {
            self.config.max_delay
        };
        self.current_delay = next.min(self.config.max_delay);

        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if factor <= 0.0 {
            return delay.min(self.config.max_delay);
        }
        let jitter = rand::rng().random_range(-factor..=factor);
        let secs = (delay.as_secs_f64() * (1.0 + jitter)).max(0.001);
        Duration::from_secs_f64(secs).min(self.config.max_delay)
    }
}
