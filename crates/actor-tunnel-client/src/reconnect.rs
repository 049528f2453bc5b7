//! Reconnection logic with exponential backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt
    #[serde(with = "crate::config::duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound for any delay
    #[serde(with = "crate::config::duration_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Fraction of each delay that may be shaved off at random (0.0 disables jitter)
    pub jitter: f64,
    /// Maximum number of consecutive attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter: 0.25,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Computes reconnect delays.
///
/// The delay for attempt `n` (starting at 0) is
/// `min(initial * multiplier^n, max)` reduced by a random fraction of at
/// most `jitter`. With the default multiplier of 2 and jitter of 0.25 the
/// jitter windows of consecutive attempts never overlap, so delays grow
/// strictly until they reach the cap.
pub struct ReconnectManager {
    config: ReconnectConfig,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Un-jittered delay for a given attempt
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi(exponent);
        let capped = millis.min(self.config.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt >= max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        let base = self.base_delay(self.attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let factor = 1.0 - rand::thread_rng().gen_range(0.0..jitter);
            base.mul_f64(factor)
        } else {
            base
        };

        self.attempt += 1;

        debug!(
            "Reconnect attempt {} scheduled in {}ms",
            self.attempt,
            delay.as_millis()
        );

        Ok(delay)
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    #[test]
    fn test_reconnect_backoff() {
        let mut manager = ReconnectManager::new(config());

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(10));
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(20));
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(40));
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(80));
        assert_eq!(manager.attempt(), 4);
        // Should cap at max_backoff
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_reconnect_reset() {
        let mut manager = ReconnectManager::new(config());

        manager.next_delay().unwrap();
        manager.next_delay().unwrap();
        assert_eq!(manager.attempt(), 2);

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(10));
    }

    #[test]
    fn test_jittered_delays_increase_within_bounds() {
        let defaults = ReconnectConfig::default();

        for _ in 0..100 {
            let mut manager = ReconnectManager::new(defaults.clone());
            let mut previous = Duration::ZERO;
            for attempt in 0..3 {
                let base = manager.base_delay(attempt);
                let delay = manager.next_delay().unwrap();
                assert!(delay <= base, "{:?} above {:?}", delay, base);
                assert!(delay >= base.mul_f64(1.0 - defaults.jitter));
                assert!(delay > previous, "{:?} not above {:?}", delay, previous);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_default_schedule_caps_at_thirty_seconds() {
        let manager = ReconnectManager::new(ReconnectConfig::default());
        assert_eq!(manager.base_delay(0), Duration::from_millis(1000));
        assert_eq!(manager.base_delay(4), Duration::from_millis(16_000));
        assert_eq!(manager.base_delay(5), Duration::from_millis(30_000));
        assert_eq!(manager.base_delay(500), Duration::from_millis(30_000));
    }

    #[test]
    fn test_max_attempts() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            max_attempts: Some(3),
            ..config()
        });

        assert!(manager.next_delay().is_ok());
        assert!(manager.next_delay().is_ok());
        assert!(manager.next_delay().is_ok());

        let result = manager.next_delay();
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsReached)));
    }
}
