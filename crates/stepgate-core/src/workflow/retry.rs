//! Retry policy with exponential backoff and jitter.
//!
//! Applied to step handler failures and, independently, to transient
//! persistence failures. The first retry waits `base_delay`; each further
//! retry doubles the delay up to `max_delay`. Jitter adds a random extra of
//! up to half the computed delay.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use stepgate_types::config::RetrySettings;
use stepgate_types::error::RepositoryError;

/// Backoff policy. `max_retries` counts retries, not attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.base_delay_ms)),
            jitter: settings.jitter,
        }
    }

    /// A policy that never waits. Handy for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Whether another retry is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry` (1-based), with jitter when enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = (delay.as_millis() / 2) as u64;
        let extra = rand::rng().random_range(0..=half);
        delay + Duration::from_millis(extra)
    }
}

/// Run a persistence operation, retrying transient failures with backoff.
///
/// Non-transient errors (conflict, not found) return immediately.
pub async fn with_persistence_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RepositoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.should_retry(retries) => {
                retries += 1;
                let delay = policy.delay_for(retries);
                tracing::warn!(
                    operation,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "persistence failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
