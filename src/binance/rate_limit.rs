// =============================================================================
// Request-Weight Tracker: keeps public REST usage under the exchange cap
// =============================================================================
//
// The exchange enforces a request-weight budget of 1200 per minute per IP
// (we hard-cap ourselves at 1000).  The tracker reads the
// `X-MBX-USED-WEIGHT-1M` response header after every request and keeps an
// atomic counter any task may query lock-free.  A reading older than the
// one-minute window no longer counts against the budget, so a quiet minute
// after hitting the cap lets requests through again.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Span the exchange counts `X-MBX-USED-WEIGHT-1M` over.
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);

/// Request weights of the endpoints this crate calls.
pub const KLINES_WEIGHT: u32 = 2;
pub const EXCHANGE_INFO_WEIGHT: u32 = 20;
pub const TICKER_PRICE_WEIGHT: u32 = 2;

/// Thread-safe weight tracker backed by an atomic counter.
pub struct WeightTracker {
    used_weight_1m: AtomicU32,
    origin: Instant,
    /// Milliseconds after `origin` of the last recorded value.
    recorded_at_ms: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl WeightTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            origin: Instant::now(),
            recorded_at_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Last recorded weight, or 0 once it has aged out of the window.
    fn current(&self) -> u32 {
        let age = self
            .elapsed_ms()
            .saturating_sub(self.recorded_at_ms.load(Ordering::Relaxed));
        if Duration::from_millis(age) >= WEIGHT_WINDOW {
            0
        } else {
            self.used_weight_1m.load(Ordering::Relaxed)
        }
    }

    /// Update the counter from the HTTP response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record(w);
    }

    /// Store an observed weight value.
    pub fn record(&self, used: u32) {
        let prev = self.current();
        self.used_weight_1m.store(used, Ordering::Relaxed);
        self.recorded_at_ms.store(self.elapsed_ms(), Ordering::Relaxed);
        if used >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = used,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = used, "request weight updated");
    }

    /// `true` if `weight` more can be spent without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.current();
        let allowed = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked, would exceed request weight"
            );
        }
        allowed
    }

    pub fn snapshot(&self) -> WeightSnapshot {
        WeightSnapshot {
            used_weight_1m: self.current(),
            hard_limit: WEIGHT_HARD_LIMIT,
        }
    }
}

impl Default for WeightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightTracker")
            .field("used_weight_1m", &self.current())
            .finish()
    }
}
