//! Caller-side retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Policy that never waits; handy for tests.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, 0, 0)
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, a fatal error occurs, or attempts run out.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries.max(1);
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                failures += 1;
                if failures >= attempts {
                    return Err(e);
                }
                let delay = policy.delay(failures);
                tracing::debug!(
                    what,
                    attempt = failures,
                    of = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying: {e}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
