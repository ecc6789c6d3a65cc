//! Per-instrument throttle gate.
//!
//! Bounds how often one instrument may pass downstream. The gate only
//! remembers the last admission per code; once admitted, the timestamp
//! sticks regardless of what the caller does with the update afterwards.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant, TryFromFloatSecsError};

/// Fractional seconds to an interval. Negatives and NaN clamp to zero
/// (pass-through); values too large for a `Duration` are an error.
pub fn interval_from_secs_f64(secs: f64) -> Result<Duration, TryFromFloatSecsError> {
    let secs = if secs.is_nan() { 0.0 } else { secs.max(0.0) };
    Duration::try_from_secs_f64(secs)
}

/// Keyed "at most once per interval" gate.
#[derive(Debug)]
pub struct ThrottleGate {
    interval: Duration,
    last_admitted: Mutex<HashMap<String, Instant>>,
}

impl ThrottleGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_admitted: Mutex::new(HashMap::new()),
        }
    }

    /// Build from fractional seconds. See [`interval_from_secs_f64`].
    pub fn from_secs_f64(secs: f64) -> Result<Self, TryFromFloatSecsError> {
        interval_from_secs_f64(secs).map(Self::new)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_pass_through(&self) -> bool {
        self.interval.is_zero()
    }

    /// Admit `code` at the current instant.
    #[inline]
    pub fn admit(&self, code: &str) -> bool {
        self.admit_at(code, Instant::now())
    }

    /// Admit `code` at `arrival`.
    pub fn admit_at(&self, code: &str, arrival: Instant) -> bool {
        if self.is_pass_through() {
            return true;
        }

        let mut last = self.last_admitted.lock();
        match last.get_mut(code) {
            Some(prev) => {
                // saturating: an out-of-order arrival counts as zero elapsed
                if arrival.saturating_duration_since(*prev) >= self.interval {
                    *prev = arrival;
                    true
                } else {
                    false
                }
            }
            None => {
                last.insert(code.to_string(), arrival);
                true
            }
        }
    }

    /// Number of codes admitted at least once.
    pub fn tracked(&self) -> usize {
        self.last_admitted.lock().len()
    }
}
