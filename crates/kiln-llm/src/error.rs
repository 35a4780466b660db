#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by {provider}")]
    RateLimited { provider: &'static str },

    #[error("{provider} unavailable: {message}")]
    Unavailable {
        provider: &'static str,
        message: String,
    },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("{provider} returned {actual} embeddings for {expected} inputs")]
    EmbeddingCount {
        provider: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether the provider pushed back on request volume rather than failing outright.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
