//! Interfaces the pipeline drives, plus LLM-backed summarizer and embedder.

use std::path::Path;
use std::sync::Arc;

use kiln_llm::{LlmProvider, Message};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::fingerprint::hash_bytes;
use crate::vector_store::BoxFuture;

/// Characters of chunk content sent to the summarizer.
const SUMMARY_INPUT_CHARS: usize = 4000;

/// One parsed unit of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub file_path: String,
    pub language: Option<String>,
    pub chunk_type: String,
    pub symbol_name: Option<String>,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub token_count: usize,
}

impl Chunk {
    #[must_use]
    pub fn content_hash(&self) -> String {
        hash_bytes(self.content.as_bytes())
    }
}

/// Yields candidate files under a root as `/`-separated relative paths.
pub trait Discoverer: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the root cannot be walked at all.
    fn discover(
        &self,
        root: &Path,
        exclude_dirs: &[String],
        exclude_patterns: &[glob::Pattern],
    ) -> Result<Vec<String>>;
}

pub trait Parser: Send + Sync {
    /// Split `source` (the content of `path`) into ordered chunks.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Parse`] if the content cannot be chunked.
    fn parse(&self, path: &str, source: &str) -> Result<Vec<Chunk>>;
}

pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, chunk: &'a Chunk) -> BoxFuture<'a, Result<String>>;
}

pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

/// Summarizer that asks a chat model for a short description of each chunk.
pub struct LlmSummarizer<P> {
    provider: Arc<P>,
}

impl<P> LlmSummarizer<P> {
    #[must_use]
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

fn summary_prompt(chunk: &Chunk) -> String {
    let lang = chunk.language.as_deref().unwrap_or("text");
    let subject = chunk
        .symbol_name
        .as_deref()
        .map_or_else(String::new, |s| format!(" (`{s}`)"));
    let body: String = chunk.content.chars().take(SUMMARY_INPUT_CHARS).collect();
    format!(
        "Summarize what this {lang} {kind}{subject} from {path}, lines {start}-{end}, does \
         in one or two sentences. Answer with the summary only.\n\n{body}",
        kind = chunk.chunk_type,
        path = chunk.file_path,
        start = chunk.start_line,
        end = chunk.end_line,
    )
}

impl<P: LlmProvider + 'static> Summarizer for LlmSummarizer<P> {
    fn summarize<'a>(&'a self, chunk: &'a Chunk) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let summary = self
                .provider
                .chat(&[Message::user(summary_prompt(chunk))])
                .await?;
            Ok(summary.trim().to_owned())
        })
    }
}

pub struct LlmEmbedder<P> {
    provider: Arc<P>,
}

impl<P> LlmEmbedder<P> {
    #[must_use]
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

impl<P: LlmProvider + 'static> Embedder for LlmEmbedder<P> {
    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
        Box::pin(async move {
            let vectors = self.provider.embed_batch(texts).await?;
            if vectors.len() != texts.len() {
                return Err(IndexError::EmbeddingCount {
                    expected: texts.len(),
                    actual: vectors.len(),
                });
            }
            Ok(vectors)
        })
    }
}
