//! Retry policy for transient remote and store failures.
//!
//! Every suspension point in a phase (page fetches, batch writes, metadata
//! lookups, job listing) goes through [`retry`]. Non-transient errors are
//! returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Retryable;

/// Delay schedule before the n-th retry (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant(Duration),
    /// `initial`, doubled for every further retry, never above `cap`.
    Doubling { initial: Duration, cap: Duration },
}

impl Backoff {
    fn nominal(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Constant(delay) => delay,
            Backoff::Doubling { initial, cap } => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(cap)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff: Backoff,
    /// Each delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::doubling(5, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::constant(0, Duration::ZERO)
    }

    /// Same delay between every attempt, without jitter.
    pub fn constant(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            backoff: Backoff::Constant(delay),
            jitter: 0.0,
        }
    }

    pub fn doubling(retries: u32, initial: Duration, cap: Duration) -> Self {
        Self {
            retries,
            backoff: Backoff::Doubling { initial, cap },
            jitter: 0.2,
        }
    }

    /// `retry` retries have already happened; may another one run?
    pub fn allows_retry(&self, retry: u32) -> bool {
        retry < self.retries
    }

    /// How long to sleep before retry number `retry` (1-based).
    pub fn delay_before(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let nominal = self.backoff.nominal(retry);
        let spread = if self.jitter.is_finite() { self.jitter.clamp(0.0, 1.0) } else { 0.0 };
        if spread == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor).unwrap_or(nominal)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + core::fmt::Display,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.allows_retry(retries) => {
                retries += 1;
                let delay = policy.delay_before(retries);
                warn!(
                    operation,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
