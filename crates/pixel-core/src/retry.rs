//! Requeue policy and backoff calculation for the delivery queue.
//!
//! The default policy retries a failed envelope immediately and forever.
//! A non-zero base delay turns on capped exponential backoff with jitter,
//! and a maximum attempt count makes the queue drop envelopes that keep
//! failing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds (immediate retry).
pub const DEFAULT_BASE_DELAY_MS: u64 = 0;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// How the delivery queue treats transport failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Base delay before re-sending a requeued envelope. `0` retries immediately.
    pub base_delay_ms: u64,
    /// Cap on the exponential delay.
    pub max_delay_ms: u64,
    /// Jitter range applied symmetrically around the computed delay.
    pub jitter_factor: f64,
    /// Attempts per envelope before it is dropped. `0` means unbounded.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `consecutive_failures` failures.
    ///
    /// `random` should be a value in `[0.0, 1.0)` from a PRNG.
    #[must_use]
    pub fn delay_for(&self, consecutive_failures: u32, random: f64) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let attempt = consecutive_failures.saturating_sub(1);
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }

    /// Whether an envelope that has already been attempted `attempts` times
    /// should be dropped instead of requeued.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

/// Exponential backoff with explicit randomness.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 ± random * jitter)`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    // Maps random [0,1) to [-jitter, +jitter]
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor;
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
