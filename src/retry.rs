//! Retry with exponential backoff.
//!
//! The policy (how many attempts, how long to wait) is kept apart from the
//! classification of which errors are worth retrying, which the caller
//! supplies per store.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (0-based), with `jitter_random` in [0, 1).
    pub fn delay_with_jitter(&self, retry: u32, jitter_random: f64) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let factor = 1.0 - self.jitter + jitter_random * 2.0 * self.jitter;
        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.delay_with_jitter(retry, rand::random::<f64>())
    }
}

/// Why a retried operation finally failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was not retryable; returned after the first occurrence.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy's attempts are used up.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                })
            }
            Err(err) => {
                let delay = policy.delay(attempt - 1);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
