use serde::{Deserialize, Serialize};

/// Limits and tuning for a single quota category.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Number of worker tasks serving this category.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Batch size recommended before any feedback has been observed.
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Consecutive failures (or throttles) that halve the batch size.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successes that grow the batch size by one.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_concurrency() -> usize {
    4
}

fn default_batch_size() -> usize {
    16
}

fn default_min_batch_size() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    64
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    5
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl QuotaConfig {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_batch_bounds(mut self, min: usize, default: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.default_batch_size = default;
        self.max_batch_size = max;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, failure: u32, success: u32) -> Self {
        self.failure_threshold = failure;
        self.success_threshold = success;
        self
    }
}
