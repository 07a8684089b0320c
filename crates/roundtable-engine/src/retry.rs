//! Retry logic with configurable backoff for store writes and external calls.

use std::time::Duration;

use roundtable_types::{Backoff, EngineError, RetrySpec};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// No delay between retries.
    None,
    /// Linear backoff: base * (attempt + 1).
    Linear { base: Duration },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Linear { base } => {
                Duration::from_millis(base.as_millis() as u64 * (attempt as u64 + 1))
            }
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt as u32);
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl From<&RetrySpec> for BackoffPolicy {
    fn from(spec: &RetrySpec) -> Self {
        let base = Duration::from_millis(spec.base_ms);
        match spec.backoff {
            Backoff::Linear => BackoffPolicy::Linear { base },
            Backoff::Exponential => BackoffPolicy::Exponential {
                base,
                max: Duration::from_secs(30),
            },
        }
    }
}

/// Execute an operation with retry logic.
///
/// The closure `f` is called up to `max_attempts` times. Retries occur only
/// when the error satisfies [`EngineError::is_retryable`]; other errors are
/// returned immediately. Between retries the function sleeps for the duration
/// dictated by `policy`.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_attempts: usize,
    policy: &BackoffPolicy,
    label: &str,
) -> roundtable_types::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = roundtable_types::Result<T>>,
{
    let attempts = max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(op = %label, attempt, delay_ms = %delay.as_millis(), error = %e, "Retryable error, retrying");
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable unless attempts == 0, which max(1) prevents; keep the
    // error path total anyway.
    Err(last_err.unwrap_or_else(|| EngineError::Other(format!("retry loop for '{label}' made no attempts"))))
}
