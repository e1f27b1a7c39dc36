//! # Retry Policy
//!
//! Capped exponential backoff with randomized jitter. The same policy type
//! drives blocking retries inside [`PersistentStore`](crate::store::PersistentStore)
//! and async retries inside the [`resilience`](crate::resilience) wrapper.
//!
//! The delay before retry `n` (1-based) is
//! `min(base_delay_ms * 2^(n-1), max_delay_ms) + uniform(0..=jitter_ms)`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::StoreResult;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling applied before jitter
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the random component added to each delay
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    25
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_jitter_ms() -> u64 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    /// Policy with `retries` additional attempts after the first.
    pub fn with_retries(retries: u32) -> Self {
        RetryPolicy {
            max_attempts: retries.saturating_add(1),
            ..RetryPolicy::default()
        }
    }

    /// Override the delay parameters.
    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self.jitter_ms = jitter_ms;
        self
    }

    /// Deterministic part of the delay before retry number `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let scaled = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(scaled.min(self.max_delay_ms))
    }

    /// Full delay before retry number `retry`, jitter included.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        self.base_delay(retry) + Duration::from_millis(jitter)
    }

    /// Attempt count, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Run `op` with blocking backoff, retrying only recoverable errors.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run_blocking<T>(
        &self,
        operation: &str,
        mut op: impl FnMut(u32) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_recoverable() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient storage failure, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_recoverable() {
                        tracing::warn!(
                            operation,
                            attempts,
                            error = %err,
                            "storage retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default().with_delays(10, 50, 0);
        assert_eq!(policy.base_delay(1), Duration::from_millis(10));
        assert_eq!(policy.base_delay(2), Duration::from_millis(20));
        assert_eq!(policy.base_delay(3), Duration::from_millis(40));
        assert_eq!(policy.base_delay(4), Duration::from_millis(50));
        assert_eq!(policy.base_delay(40), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default().with_delays(10, 10, 5);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_run_blocking_retries_transient_errors() {
        let policy = RetryPolicy::with_retries(3).with_delays(1, 2, 0);
        let mut calls = 0;
        let result = policy.run_blocking("save", |_| {
            calls += 1;
            if calls < 3 {
                Err(StoreError::transient("save", "database is locked"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_run_blocking_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::with_retries(3).with_delays(1, 2, 0);
        let mut calls = 0;
        let result: StoreResult<()> = policy.run_blocking("load", |_| {
            calls += 1;
            Err(StoreError::data_corrupted("p-1", "checksum mismatch"))
        });
        assert_eq!(result.unwrap_err().error_code(), "DATA_CORRUPTED");
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_run_blocking_gives_up_after_max_attempts() {
        let policy = RetryPolicy::with_retries(2).with_delays(1, 1, 0);
        let mut calls = 0;
        let result: StoreResult<()> = policy.run_blocking("save", |_| {
            calls += 1;
            Err(StoreError::transient("save", "busy"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
