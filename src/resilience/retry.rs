//! # Retry Policies
//!
//! Explicit backoff policies for the two connection-establishment paths:
//!
//! - [`RetryPolicy`] bounds message-bus connect and producer creation
//!   (`initial_delay * multiplier^(attempt - 1)` between attempts).
//! - [`ReconnectPolicy`] governs re-establishing the LISTEN connection
//!   (`unit * base^failures` before each retry, fatal past the ceiling).
//!
//! Per-message publishing is never retried here.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{ListenerError, Result};

/// Bounded exponential retry used for bus connection establishment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after each further failure
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            multiplier,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Sleep applied after failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.initial_delay().as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ListenerError::config("max_attempts must be at least 1"));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(ListenerError::config(
                "multiplier must be a finite number >= 1.0",
            ));
        }
        Ok(())
    }

    /// Run `operation` until it succeeds or attempts run out.
    ///
    /// The closure receives the 1-based attempt number. Exhaustion yields
    /// [`ListenerError::ConnectionExhausted`] carrying the last failure.
    pub async fn retry<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.delay_for_attempt(attempt);
                        warn!(
                            operation = operation_name,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            operation = operation_name,
            attempts = max_attempts,
            error = %last_error,
            "Retry attempts exhausted"
        );

        Err(ListenerError::ConnectionExhausted {
            operation: operation_name.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Reconnect policy for the LISTEN connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Highest consecutive failure count that is still retried
    pub max_failures: u32,
    /// Exponential base
    pub base: u32,
    /// Length of one time unit, in milliseconds
    pub unit_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            base: 2,
            unit_ms: 1000,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_failures: u32, base: u32, unit: Duration) -> Self {
        Self {
            max_failures,
            base,
            unit_ms: unit.as_millis() as u64,
        }
    }

    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }

    /// Whether a retry is allowed after `failures` consecutive failures
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_failures
    }

    /// Backoff before the retry that follows `failures` consecutive failures
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        let factor = self.base.saturating_pow(failures);
        self.unit().saturating_mul(factor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base == 0 {
            return Err(ListenerError::config("reconnect base must be at least 1"));
        }
        Ok(())
    }
}
