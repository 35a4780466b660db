//! Incremental repository indexing.
//!
//! Files are fingerprinted by content hash, ranked under a file budget,
//! chunked, summarized and embedded through quota-governed worker pools, and
//! written to a vector store in retried batches. Only changed files are
//! reprocessed, and inside a changed file only changed chunks are re-embedded.

pub mod chunker;
pub mod collaborators;
pub(crate) mod context;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod indexer;
pub mod languages;
pub mod memory_store;
pub mod priority;
pub mod qdrant;
pub mod retry;
pub mod sink;
pub mod vector_store;
pub mod watcher;

pub use collaborators::{Chunk, Discoverer, Embedder, LlmEmbedder, LlmSummarizer, Parser, Summarizer};
pub use error::{IndexError, Result};
pub use fingerprint::{ContentFingerprintStore, Manifest, ProcessingStatus};
pub use indexer::{Collaborators, IndexPipeline, PipelineConfig, RunStats, WatchFilter};
pub use priority::{EntryPointRule, NamingConvention, PriorityEntry, PriorityScheduler};
pub use retry::RetryPolicy;
pub use sink::{EmbeddingPoint, RetryingUpsertSink, SearchFilters, SearchHit, UpsertReport};
