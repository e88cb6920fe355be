//! Exponential backoff reconnection logic.

use std::time::Duration;

use rand::Rng;

/// Configuration for exponential backoff reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for each successive attempt.
    pub multiplier: f64,
    /// Random extra delay, as a fraction of the current delay (0.0 = none).
    pub jitter: f64,
    /// Maximum number of attempts (None = infinite).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Unlimited attempts between `base` and `max`.
    pub fn unlimited(base: Duration, max: Duration) -> Self {
        Self {
            initial_delay: base,
            max_delay: max.max(base),
            ..Self::default()
        }
    }
}

/// Tracks reconnection state and calculates delays.
///
/// Delays never decrease between two resets and never exceed `max_delay`,
/// jitter included.
#[derive(Debug)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
    last_delay: Duration,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial_delay,
            last_delay: Duration::ZERO,
        }
    }

    /// Returns the next delay, or None if max attempts exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        let base = self.current_delay.as_secs_f64();
        let jitter = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.jitter) * base
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64(base + jitter)
            .max(self.last_delay)
            .min(self.config.max_delay);

        self.attempts += 1;
        self.last_delay = delay;

        // Calculate next delay with exponential backoff
        let next = Duration::from_secs_f64(
            (self.current_delay.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        self.current_delay = next;

        Some(delay)
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
        self.last_delay = Duration::ZERO;
    }

    /// Get current attempt count.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The delay cap used for attempts past the limit.
    pub fn max_delay(&self) -> Duration {
        self.config.max_delay
    }
}
