//! Bounded exponential backoff shared by every retry loop in the workspace.
//!
//! Optimistic-conflict loops, Kubernetes API calls, and synchronization
//! server requests all retry through [`RetryPolicy::run`], which gives up with
//! a typed [`RetryError::Exhausted`] instead of looping forever.

use std::future::Future;
use std::time::Duration;

/// Classifies an error as transient (worth retrying) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Expected contention (an optimistic write lost to a concurrent one)
    /// rather than a fault. Retried quietly.
    fn is_contention(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{operation} failed after {attempts} attempts")]
    Exhausted {
        operation: String,
        attempts: u32,
        source: E,
    },

    #[error(transparent)]
    Permanent(E),
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The underlying error, regardless of how the loop ended.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } => source,
            Self::Permanent(e) => e,
        }
    }
}

/// Retry budget: at most `max_attempts` tries, sleeping
/// `base_delay * 2^n` (capped at `max_delay`) between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Retryable + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(RetryError::Permanent(e)),
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(
                        operation,
                        attempts = attempt,
                        error = %e,
                        "giving up after exhausting retries",
                    );
                    return Err(RetryError::Exhausted {
                        operation: operation.to_owned(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) if e.is_contention() => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "concurrent write detected, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
