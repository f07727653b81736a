//! Retry with exponential backoff and jitter
//!
//! Wraps a single fallible async attempt. Errors classify themselves through
//! [`Retryable`]; anything that says "do not retry" (a breaker-open rejection,
//! a 4xx response) is returned after the first attempt.

use crate::breaker::BreakerError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Classification hook for retried errors
pub trait Retryable: Sized {
    /// Whether another attempt may succeed
    fn is_retryable(&self) -> bool {
        true
    }

    /// Error to report when an attempt exceeds its timeout
    fn timed_out(after: Duration) -> Self;
}

impl<E: Retryable> Retryable for BreakerError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Open(_) => false,
            Self::Inner(e) => e.is_retryable(),
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Inner(E::timed_out(after))
    }
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Growth factor applied per retry
    pub backoff_multiplier: f64,
    /// Ceiling on a single delay
    pub max_backoff_ms: u64,
    /// Fraction of the delay randomly added or removed (0.0 - 1.0)
    pub jitter_factor: f64,
    /// Per-attempt timeout
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter_factor: 0.1,
            attempt_timeout_ms: 10_000,
        }
    }
}

/// Bounded retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Executor applying `config` to every [`RetryExecutor::execute`] call
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Active retry policy
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.config.max_attempts.saturating_sub(1)
    }

    /// Un-jittered delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let raw = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.config.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor.clamp(0.0, 1.0);
        if factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-factor..=factor);
        let ms = delay.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or attempts
    /// run out. The last error is returned unchanged.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        let mut attempt: u32 = 0;

        loop {
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(timeout)),
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::debug!(error = %e, "non-retryable error, giving up");
                    return Err(e);
                }
                Err(e) if attempt >= self.max_retries() => {
                    tracing::warn!(attempts = attempt + 1, error = %e, "retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.with_jitter(self.backoff(attempt));
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
