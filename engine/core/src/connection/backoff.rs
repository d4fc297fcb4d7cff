//! Reconnect backoff
//!
//! Delay for attempt `n` (1-based) is `initial * multiplier^(n-1)`, capped at
//! `max`, then spread by uniform jitter of `±jitter` of the capped value.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::span;

/// Backoff settings, in time units
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay in units (default: 1)
    pub initial_units: u32,
    /// Growth factor per attempt (default: 2.0)
    pub multiplier: f64,
    /// Delay cap in units (default: 32)
    pub max_units: u32,
    /// Jitter fraction (default: 0.1, i.e. ±10%)
    pub jitter: f64,
    /// Reconnect attempts before giving up (default: 3)
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_units: 1,
            multiplier: 2.0,
            max_units: 32,
            jitter: 0.1,
            max_retries: 3,
        }
    }
}

/// Backoff settings resolved to wall time
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// First retry delay
    pub initial: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Delay cap
    pub max: Duration,
    /// Jitter fraction
    pub jitter: f64,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
}

impl BackoffPolicy {
    /// Resolve a config against the engine's time unit
    #[must_use]
    pub fn from_config(config: &BackoffConfig, unit: Duration) -> Self {
        Self {
            initial: span(unit, config.initial_units),
            multiplier: config.multiplier,
            max: span(unit, config.max_units),
            jitter: config.jitter,
            max_retries: config.max_retries,
        }
    }

    /// Delay before attempt `attempt` (1-based), without jitter
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let base = self.initial.as_secs_f64() * factor;
        if !base.is_finite() || base >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(base)
    }

    /// Delay before attempt `attempt` (1-based), with jitter applied
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(attempt, &mut rand::thread_rng())
    }

    fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter;
        let offset = rng.gen_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Check if another attempt is allowed after `attempts` were made
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}
