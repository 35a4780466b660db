use std::time::Duration;

use serde::Serialize;

use crate::adaptive::AdaptiveBatch;
use crate::limiter::LimiterState;

/// Smoothing factor for the rolling latency and error-rate estimates.
const EWMA_ALPHA: f64 = 0.2;

/// Read-only snapshot of a quota category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaMetrics {
    pub quota: String,
    pub state: LimiterState,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub throttled: u64,
    pub queued: usize,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    Throttled,
}

/// Mutable counters behind a quota channel.
#[derive(Debug)]
pub(crate) struct QuotaStats {
    pub(crate) submitted: u64,
    pub(crate) succeeded: u64,
    pub(crate) failed: u64,
    pub(crate) throttled: u64,
    latency_ms: Option<f64>,
    error_rate: f64,
    pub(crate) batch: AdaptiveBatch,
}

impl QuotaStats {
    pub(crate) fn new(batch: AdaptiveBatch) -> Self {
        Self {
            submitted: 0,
            succeeded: 0,
            failed: 0,
            throttled: 0,
            latency_ms: None,
            error_rate: 0.0,
            batch,
        }
    }

    /// Apply one completed call. Returns `true` if the adaptive batch size changed.
    pub(crate) fn record(&mut self, outcome: Outcome, elapsed: Duration) -> bool {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.latency_ms = Some(match self.latency_ms {
            Some(prev) => prev + EWMA_ALPHA * (ms - prev),
            None => ms,
        });
        let err = if outcome == Outcome::Success { 0.0 } else { 1.0 };
        self.error_rate += EWMA_ALPHA * (err - self.error_rate);

        match outcome {
            Outcome::Success => {
                self.succeeded += 1;
                self.batch.on_success()
            }
            Outcome::Failure => {
                self.failed += 1;
                self.batch.on_failure()
            }
            Outcome::Throttled => {
                self.throttled += 1;
                self.batch.on_failure()
            }
        }
    }

    pub(crate) fn snapshot(&self, quota: &str, state: LimiterState, queued: usize) -> QuotaMetrics {
        QuotaMetrics {
            quota: quota.to_owned(),
            state,
            submitted: self.submitted,
            succeeded: self.succeeded,
            failed: self.failed,
            throttled: self.throttled,
            queued,
            avg_latency_ms: self.latency_ms.unwrap_or(0.0),
            error_rate: self.error_rate,
            batch_size: self.batch.current(),
        }
    }
}
