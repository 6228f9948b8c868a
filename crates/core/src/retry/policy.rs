//! Retry decisions and bounded retry of fallible async calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::config::{BackoffConfig, FetchRetryConfig};

/// Capped exponential backoff with a retry budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `retry_after` has passed.
    Retry {
        retry_count: u32,
        retry_after: DateTime<Utc>,
    },
    /// Budget spent; freeze the item.
    Exhausted { retry_count: u32 },
}

impl RetryDecision {
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryDecision::Retry { retry_count, .. } | RetryDecision::Exhausted { retry_count } => {
                *retry_count
            }
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: &BackoffConfig) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(backoff.initial_delay_ms),
            multiplier: backoff.multiplier,
            max_delay: Duration::from_millis(backoff.max_delay_ms),
        }
    }

    /// Fetch retries double from the configured initial delay.
    pub fn for_fetch(config: &FetchRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Decide the next step for an item that has already failed
    /// `retry_count` times at this stage.
    pub fn decide(&self, retry_count: u32, now: DateTime<Utc>) -> RetryDecision {
        let next = retry_count.saturating_add(1);
        if next > self.max_retries {
            return RetryDecision::Exhausted { retry_count: next };
        }

        let wait = self.delay(next);
        let wait = chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::MAX);
        RetryDecision::Retry {
            retry_count: next,
            retry_after: now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Errors that may succeed when the same call is repeated.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or the retry
/// budget of `policy` is spent. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let wait = policy.delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}
