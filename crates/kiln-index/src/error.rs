//! Error types for kiln-index.

use kiln_quota::QuotaFailure;

use crate::vector_store::VectorStoreError;

/// Errors that can occur during indexing.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files or the manifest.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    /// LLM provider error (summarization or embedding).
    #[error("LLM error: {0}")]
    Llm(#[from] kiln_llm::LlmError),

    /// Rate limiter misuse or a dropped task.
    #[error("quota error: {0}")]
    Quota(#[from] kiln_quota::QuotaError),

    /// Source could not be split into chunks.
    #[error("parse failed: {0}")]
    Parse(String),

    #[error("embedding dimension mismatch: collection expects {expected}, provider returned {actual}")]
    DimensionMismatch { expected: u64, actual: u64 },

    #[error("embedder returned {actual} vectors for {expected} inputs")]
    EmbeddingCount { expected: usize, actual: usize },

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Errors that end the whole run instead of a single file.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Quota(
                kiln_quota::QuotaError::NotRunning { .. } | kiln_quota::QuotaError::UnknownQuota(_)
            ) | Self::DimensionMismatch { .. }
                | Self::Pattern(_)
        )
    }
}

impl QuotaFailure for IndexError {
    fn is_throttled(&self) -> bool {
        matches!(self, Self::Llm(e) if e.is_rate_limited())
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
