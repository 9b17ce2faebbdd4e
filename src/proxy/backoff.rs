//! Randomized exponential backoff for upstream reconnects

use rand::Rng;

/// Maximum reconnect backoff delay in seconds
pub const MAX_RECONNECT_DELAY: f64 = 60.0;

/// Widest jitter half-spread, applied while the delay is still growing
const JITTER_WIDE: f64 = 0.25;

/// Narrowest jitter half-spread, applied once the delay has saturated
const JITTER_NARROW: f64 = 0.10;

/// Computes randomized, capped exponential reconnect delays.
///
/// Each call to [`get_next`](Self::get_next) doubles the base delay up to
/// the cap and applies multiplicative jitter. The jitter spread narrows
/// linearly from ±25% towards ±10% as the base approaches the cap, so many
/// gateway instances do not reconnect in lockstep while steady-state retry
/// intervals stay predictable.
#[derive(Debug)]
pub struct BackoffScheduler {
    attempt_counter: u32,
    max_delay: f64,
}

impl BackoffScheduler {
    /// Create a scheduler with the given delay cap in seconds
    pub fn new(max_delay: f64) -> Self {
        Self {
            attempt_counter: 0,
            max_delay,
        }
    }

    /// Get the delay in seconds to wait before the next reconnect attempt.
    ///
    /// Increments the attempt counter.
    pub fn get_next(&mut self) -> f64 {
        self.attempt_counter += 1;
        // exponent clamp keeps 2^n finite for long outages
        let exponent = self.attempt_counter.min(32);
        let base = 2f64.powi(exponent as i32).min(self.max_delay);

        let spread = JITTER_WIDE - (JITTER_WIDE - JITTER_NARROW) * (base / self.max_delay);
        let jitter = rand::thread_rng().gen_range(-spread..=spread);

        base * (1.0 + jitter)
    }

    /// Reset the attempt counter after a successful reconnect
    pub fn reset(&mut self) {
        self.attempt_counter = 0;
    }

    /// Read-only view of the attempt counter
    pub fn counter(&self) -> u32 {
        self.attempt_counter
    }
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_DELAY)
    }
}
