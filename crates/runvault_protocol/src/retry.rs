//! Narrow retry policy for provider calls.

use crate::defaults::{DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_MAX_RETRIES};
use crate::error_code::{is_retryable, CallKind, ProviderError};
use std::time::Duration;

/// How many extra attempts a provider call gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Default attempt count with no sleeping (tests, diagnostics).
    pub fn without_delay() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt + 1`: `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Run `op`, repeating it while the failure is retryable and the budget allows.
///
/// `op` receives the zero-based attempt number. `on_retry` is called with the
/// upcoming attempt number and the error that triggered it, before sleeping.
pub fn run_with_retry<T, F, R>(
    policy: &RetryPolicy,
    kind: CallKind,
    mut op: F,
    mut on_retry: R,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Result<T, ProviderError>,
    R: FnMut(u32, &ProviderError),
{
    let mut attempt = 0u32;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !is_retryable(&err, kind) {
                    return Err(err);
                }
                on_retry(attempt + 1, &err);
                let delay = policy.delay_for(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}
