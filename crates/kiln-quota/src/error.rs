use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    /// Submission outside the `running` state. Indicates a lifecycle bug in the caller.
    #[error("quota `{quota}` is not running")]
    NotRunning { quota: String },
    #[error("unknown quota `{0}`")]
    UnknownQuota(String),
    #[error("task on quota `{quota}` was dropped before completing")]
    Cancelled { quota: String },
}

pub type Result<T> = std::result::Result<T, QuotaError>;

/// Classifies a task error for the adaptive batch controller.
///
/// Throttling (provider-side rate limiting) is counted separately from plain
/// failures in [`crate::QuotaMetrics`]; both shrink the batch size.
pub trait QuotaFailure {
    fn is_throttled(&self) -> bool {
        false
    }
}
