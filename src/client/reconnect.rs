//! Pluggable reconnect delay schedules.

use crate::error::MqttError;
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Cap on the exponential shift so the doubling can never overflow.
const MAX_BACKOFF_SHIFT: u32 = 30;

/// A reconnect delay schedule.
///
/// `next_delay` is queried once per attempt with a 1-indexed attempt
/// counter and the error that caused the (re)connection to fail.
/// Returning `None` stops reconnecting.
pub trait ReconnectStrategy: Send + Sync + fmt::Debug {
    fn next_delay(&self, attempt: u32, cause: &MqttError) -> Option<Duration>;
}

// ---------------------------------------------------------------------------
// Exponential backoff
// ---------------------------------------------------------------------------

/// `min(max_delay, initial_delay * 2^(attempt-1))` with optional uniform
/// jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    max_attempts: u32,
}

impl ExponentialBackoff {
    /// Panics if `initial_delay` is zero or `max_delay < initial_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        assert!(!initial_delay.is_zero(), "initial delay must be positive");
        assert!(
            max_delay >= initial_delay,
            "max delay must be at least the initial delay"
        );
        Self {
            initial_delay,
            max_delay,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }

    /// Add a uniform random delay in `[0, delay * factor]`, still capped
    /// by the maximum delay. Panics unless `factor` is within `[0, 1]`.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&factor),
            "jitter factor must be within [0, 1]"
        );
        self.jitter_factor = factor;
        self
    }

    /// Stop after this many attempts; 0 means unlimited.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, _cause: &MqttError) -> Option<Duration> {
        if self.max_attempts != 0 && attempt > self.max_attempts {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let delay = self
            .initial_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if self.jitter_factor > 0.0 {
            let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter_factor));
            Some((delay + jitter).min(self.max_delay))
        } else {
            Some(delay)
        }
    }
}

// ---------------------------------------------------------------------------
// Constant delay
// ---------------------------------------------------------------------------

/// The same delay for every attempt.
#[derive(Debug, Clone)]
pub struct ConstantDelay {
    delay: Duration,
    max_attempts: u32,
}

impl ConstantDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: 0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl ReconnectStrategy for ConstantDelay {
    fn next_delay(&self, attempt: u32, _cause: &MqttError) -> Option<Duration> {
        if self.max_attempts != 0 && attempt > self.max_attempts {
            return None;
        }
        Some(self.delay)
    }
}

// ---------------------------------------------------------------------------
// Linear backoff
// ---------------------------------------------------------------------------

/// `initial + step * (attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    initial_delay: Duration,
    step: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl LinearBackoff {
    pub fn new(initial_delay: Duration, step: Duration, max_delay: Duration) -> Self {
        assert!(
            max_delay >= initial_delay,
            "max delay must be at least the initial delay"
        );
        Self {
            initial_delay,
            step,
            max_delay,
            max_attempts: 0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl ReconnectStrategy for LinearBackoff {
    fn next_delay(&self, attempt: u32, _cause: &MqttError) -> Option<Duration> {
        if self.max_attempts != 0 && attempt > self.max_attempts {
            return None;
        }
        let steps = attempt.saturating_sub(1);
        let delay = self
            .step
            .checked_mul(steps)
            .and_then(|grown| self.initial_delay.checked_add(grown))
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

// ---------------------------------------------------------------------------
// No reconnect
// ---------------------------------------------------------------------------

/// Never reconnect.
#[derive(Debug, Clone, Default)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn next_delay(&self, _attempt: u32, _cause: &MqttError) -> Option<Duration> {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
