//! Test-only mock LLM provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{LlmError, Result};
use crate::provider::{LlmProvider, Message};

/// Scriptable provider that counts calls and produces deterministic embeddings.
#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    chat_calls: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
    embedded_texts: Arc<AtomicUsize>,
    pub default_response: String,
    pub dimension: usize,
    pub fail_chat: bool,
    pub fail_embed: bool,
    /// Number of upcoming calls (chat or embed) that answer with `RateLimited`.
    pub rate_limit_next: Arc<AtomicUsize>,
    /// Milliseconds to sleep before returning a response.
    pub delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            embedded_texts: Arc::new(AtomicUsize::new(0)),
            default_response: "mock summary".into(),
            dimension: 8,
            fail_chat: false,
            fail_embed: false,
            rate_limit_next: Arc::new(AtomicUsize::new(0)),
            delay_ms: 0,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    #[must_use]
    pub fn failing_embeddings(mut self) -> Self {
        self.fail_embed = true;
        self
    }

    #[must_use]
    pub fn failing_chat(mut self) -> Self {
        self.fail_chat = true;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Answer the next `n` calls with `RateLimited`.
    pub fn rate_limit(&self, n: usize) {
        self.rate_limit_next.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn embedded_texts(&self) -> usize {
        self.embedded_texts.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
    }

    fn take_rate_limit(&self) -> bool {
        self.rate_limit_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Deterministic pseudo-embedding so identical text lands on identical vectors.
    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let seed = text
            .bytes()
            .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        (0..self.dimension)
            .map(|i| {
                let mixed = seed.rotate_left(u32::try_from(i % 32).unwrap_or(0)) % 1000;
                #[allow(clippy::cast_precision_loss)]
                let v = mixed as f32 / 1000.0;
                v + 0.001
            })
            .collect()
    }
}

impl LlmProvider for MockProvider {
    async fn chat(&self, _messages: &[Message]) -> Result<String> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.take_rate_limit() {
            return Err(LlmError::RateLimited { provider: "mock" });
        }
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.take_rate_limit() {
            return Err(LlmError::RateLimited { provider: "mock" });
        }
        if self.fail_embed {
            return Err(LlmError::Other("mock embedding error".into()));
        }
        self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}
