//! Randomized timing for reconnects, polls, heartbeats and startup stagger.
//!
//! Every schedule is split into a pure window computation and a random draw
//! inside that window, so the windows can be tested without an RNG.

use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::constants::{INTERVAL_JITTER, MAX_RETRY_DELAY_SECS, RECONNECT_BASE_MS};

/// Exponential reconnect backoff with a jitter band.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the nominal delay that may be shaved off, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RECONNECT_BASE_MS),
            max: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Nominal delay after `failures` consecutive failures: `base * 2^(failures-1)`, capped.
    pub fn nominal(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// Range the randomized delay is drawn from, in milliseconds.
    pub fn window(&self, failures: u32) -> RangeInclusive<u64> {
        let nominal = self.nominal(failures).as_millis() as u64;
        let low = (nominal as f64 * (1.0 - self.jitter)) as u64;
        low..=nominal
    }

    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        Duration::from_millis(draw(rng, self.window(failures)))
    }
}

/// Symmetric jitter window around `interval`, in milliseconds.
pub fn jitter_window(interval: Duration, band: f64) -> RangeInclusive<u64> {
    let ms = interval.as_millis() as u64;
    let spread = (ms as f64 * band.clamp(0.0, 1.0)) as u64;
    ms.saturating_sub(spread)..=ms.saturating_add(spread)
}

/// Draw a jittered interval around `interval` using the default band.
pub fn jittered(interval: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(draw(&mut rng, jitter_window(interval, INTERVAL_JITTER)))
}

/// Delay before the listener at `index` (of `total`) starts.
///
/// Slots are spread evenly over the stagger span and each start lands at a
/// random point inside its slot, so restarts do not line up across instances.
pub fn stagger_window(index: usize, total: usize, span: Duration) -> RangeInclusive<u64> {
    if total <= 1 {
        return 0..=0;
    }
    let span_ms = span.as_millis() as u64;
    let slot = span_ms / total as u64;
    let start = slot * index as u64;
    start..=start + slot.saturating_sub(1)
}

pub fn stagger(index: usize, total: usize, span: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let window = stagger_window(index, total, span);
    Duration::from_millis(draw(&mut rng, window))
}

fn draw<R: Rng + ?Sized>(rng: &mut R, window: RangeInclusive<u64>) -> u64 {
    if window.start() >= window.end() {
        *window.start()
    } else {
        rng.gen_range(window)
    }
}
