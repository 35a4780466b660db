//! Quota-aware admission control for calls to rate-limited external services.
//!
//! Each quota category (for example summarization and embedding) owns a bounded
//! worker pool, a priority queue of pending tasks, counters, and an adaptive
//! batch size that shrinks under failures and recovers under sustained success.
//! Categories never share workers, so a failing provider cannot stall another.

mod adaptive;
mod config;
mod error;
mod limiter;
mod metrics;

pub use adaptive::AdaptiveBatch;
pub use config::QuotaConfig;
pub use error::{QuotaError, QuotaFailure, Result};
pub use limiter::{EMBEDDING, LimiterState, QuotaRateLimiter, SUMMARIZATION};
pub use metrics::QuotaMetrics;
