//! Wires a [`Config`] into a ready-to-run indexing pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kiln_index::chunker::LineChunker;
use kiln_index::discovery::WalkDiscoverer;
use kiln_index::fingerprint::ManifestStats;
use kiln_index::memory_store::InMemoryVectorStore;
use kiln_index::qdrant::QdrantStore;
use kiln_index::vector_store::VectorStore;
use kiln_index::watcher::IndexWatcher;
use kiln_index::{
    Collaborators, ContentFingerprintStore, Embedder, IndexPipeline, LlmEmbedder, LlmSummarizer,
    NamingConvention, PipelineConfig, PriorityScheduler, ProcessingStatus, RetryingUpsertSink,
    RunStats, SearchFilters, SearchHit, Summarizer,
};
use kiln_llm::LlmProvider;
use kiln_llm::ollama::OllamaProvider;
use kiln_quota::{EMBEDDING, QuotaRateLimiter, SUMMARIZATION};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{Config, VectorBackend};

/// Priority given to interactive query embeddings; ahead of any indexing work.
const QUERY_PRIORITY: u32 = 0;

/// A running pipeline together with the handles needed to query and shut it down.
pub struct Indexer {
    pipeline: Arc<Mutex<IndexPipeline>>,
    limiter: QuotaRateLimiter,
    sink: Arc<RetryingUpsertSink>,
    embedder: Arc<dyn Embedder>,
    root: PathBuf,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("root", &self.root)
            .field("collection", &self.sink.collection())
            .finish_non_exhaustive()
    }
}

/// Build an [`Indexer`] backed by Ollama for summaries and embeddings.
///
/// Must be called from within a tokio runtime: the limiter's workers start here.
///
/// # Errors
///
/// Returns an error if the vector store client cannot be created or the
/// configured exclusions are invalid.
pub fn build_indexer(config: &Config) -> anyhow::Result<Indexer> {
    let provider = Arc::new(OllamaProvider::new(
        &config.llm.base_url,
        config.llm.model.clone(),
        config.llm.embedding_model.clone(),
    ));
    tracing::info!(
        base_url = %config.llm.base_url,
        model = %config.llm.model,
        embedding_model = %config.llm.embedding_model,
        "using ollama provider"
    );
    build_with_provider(config, provider)
}

/// Build an [`Indexer`] around an arbitrary provider.
///
/// # Errors
///
/// See [`build_indexer`].
pub fn build_with_provider<P: LlmProvider + 'static>(
    config: &Config,
    provider: Arc<P>,
) -> anyhow::Result<Indexer> {
    let store = build_store(config)?;
    let summarizer: Option<Arc<dyn Summarizer>> = config
        .index
        .summarize
        .then(|| Arc::new(LlmSummarizer::new(Arc::clone(&provider))) as Arc<dyn Summarizer>);
    let embedder: Arc<dyn Embedder> = Arc::new(LlmEmbedder::new(provider));
    build_with_parts(config, store, summarizer, embedder)
}

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn VectorStore>> {
    Ok(match config.vector_store.backend {
        VectorBackend::Qdrant => {
            let store = QdrantStore::connect(&config.vector_store.url)
                .context("failed to set up qdrant client")?;
            tracing::info!(url = %config.vector_store.url, "using qdrant vector store");
            Arc::new(store)
        }
        VectorBackend::Memory => {
            tracing::info!("using in-memory vector store");
            Arc::new(InMemoryVectorStore::new())
        }
    })
}

/// Build an [`Indexer`] from explicit collaborators.
///
/// # Errors
///
/// Returns an error if the configured exclusions are invalid.
pub fn build_with_parts(
    config: &Config,
    store: Arc<dyn VectorStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Arc<dyn Embedder>,
) -> anyhow::Result<Indexer> {
    let root = config.index.root.clone();
    let fingerprints =
        ContentFingerprintStore::load(config.index.resolved_manifest_path(), root.clone());

    let limiter = QuotaRateLimiter::new([
        (SUMMARIZATION, config.quota.summarization.clone()),
        (EMBEDDING, config.quota.embedding.clone()),
    ]);
    limiter.start();

    let sink = Arc::new(RetryingUpsertSink::new(
        store,
        config.index.collection.clone(),
        config.sink.backoff(),
        config.vector_store.dimension,
    ));

    let pipeline_config = PipelineConfig {
        file_budget: config.index.file_budget,
        exclude_dirs: config.index.exclude_dirs.clone(),
        exclude_patterns: config.index.exclude_patterns.clone(),
        summarize: config.index.summarize,
        retry: config.retry,
        sink_batch_size: config.sink.batch_size,
        sink_max_retries: config.sink.max_retries,
        ..PipelineConfig::default()
    };

    let pipeline = IndexPipeline::new(
        fingerprints,
        PriorityScheduler::new(NamingConvention::new(&config.index.entry_point_names)),
        limiter.clone(),
        Arc::clone(&sink),
        Collaborators {
            discoverer: Box::new(WalkDiscoverer),
            parser: Box::new(LineChunker::new(config.chunker)),
            summarizer,
            embedder: Arc::clone(&embedder),
        },
        pipeline_config,
    )
    .context("failed to build indexing pipeline")?;

    Ok(Indexer {
        pipeline: Arc::new(Mutex::new(pipeline)),
        limiter,
        sink,
        embedder,
        root,
    })
}

impl Indexer {
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn limiter(&self) -> &QuotaRateLimiter {
        &self.limiter
    }

    /// Run one incremental pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the run aborts on a fatal condition.
    pub async fn run(&self) -> anyhow::Result<RunStats> {
        let mut pipeline = self.pipeline.lock().await;
        let stats = pipeline.run().await.context("indexing run failed")?;
        Ok(stats)
    }

    /// Re-run the pipeline whenever indexable files under the root change.
    ///
    /// The returned watcher must be kept alive for watching to continue.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be started.
    pub async fn watch(&self, debounce: Duration) -> anyhow::Result<IndexWatcher> {
        let filter = self.pipeline.lock().await.watch_filter();
        let watcher = IndexWatcher::start(&self.root, Arc::clone(&self.pipeline), filter, debounce)
            .with_context(|| format!("failed to watch {}", self.root.display()))?;
        tracing::info!(root = %self.root.display(), "watching for changes");
        Ok(watcher)
    }

    /// Embed `query` through the embedding quota and search the collection.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding or the store search fails.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let embedder = Arc::clone(&self.embedder);
        let texts = vec![query.to_owned()];
        let mut vectors = self
            .limiter
            .submit(EMBEDDING, QUERY_PRIORITY, async move {
                embedder.embed_batch(&texts).await
            })
            .await
            .context("query embedding was not scheduled")?
            .context("failed to embed query")?;
        let vector = vectors.pop().context("embedder returned no vector")?;
        let hits = self
            .sink
            .search(vector, limit, filters)
            .await
            .context("vector search failed")?;
        Ok(hits)
    }

    /// Stop the limiter after in-flight work drains.
    pub async fn shutdown(&self) {
        self.limiter.stop().await;
    }
}

/// Manifest summary reported without touching any collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest_exists: bool,
    pub pending: usize,
    #[serde(flatten)]
    pub stats: ManifestStats,
}

/// Read the manifest named by `config` and summarize it.
#[must_use]
pub fn status(config: &Config) -> StatusReport {
    let manifest_path = config.index.resolved_manifest_path();
    let store = ContentFingerprintStore::load(manifest_path.clone(), config.index.root.clone());
    let manifest = store.manifest();

    let mut stats = manifest.stats.clone();
    stats.total_files = manifest.files.len();
    stats.total_chunks = manifest.chunks.len();
    stats.completed = 0;
    stats.failed = 0;
    let mut pending = 0;
    for fp in manifest.files.values() {
        match fp.status {
            ProcessingStatus::Completed => stats.completed += 1,
            ProcessingStatus::Failed => stats.failed += 1,
            ProcessingStatus::Pending | ProcessingStatus::Processing => pending += 1,
        }
    }

    StatusReport {
        root: config.index.root.clone(),
        manifest_exists: manifest_path.exists(),
        manifest_path,
        pending,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use kiln_llm::mock::MockProvider;

    use super::*;

    fn memory_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.index.root = root.to_path_buf();
        config.vector_store.backend = VectorBackend::Memory;
        config.retry = kiln_index::RetryPolicy::immediate(2);
        config.sink.base_delay_ms = 0;
        config.sink.max_delay_ms = 0;
        config
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn build_run_and_search_with_memory_backend() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {\n    run();\n}\n");
        write(dir.path(), "src/util.rs", "pub fn run() {}\n");

        let config = memory_config(dir.path());
        let provider = Arc::new(MockProvider::default());
        let indexer = build_with_provider(&config, Arc::clone(&provider)).unwrap();

        let stats = indexer.run().await.unwrap();
        assert_eq!(stats.files_processed, 2);
        assert_eq!(stats.files_failed, 0);
        assert!(stats.summaries_generated > 0);

        let hits = indexer
            .search("fn main() {\n    run();\n}\n", 5, &SearchFilters::default())
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().any(|h| h.file_path == "src/main.rs"));

        indexer.shutdown().await;
    }

    #[tokio::test]
    async fn summarize_disabled_skips_chat() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "lib.rs", "pub fn a() {}\n");

        let mut config = memory_config(dir.path());
        config.index.summarize = false;
        let provider = Arc::new(MockProvider::default());
        let indexer = build_with_provider(&config, Arc::clone(&provider)).unwrap();

        let stats = indexer.run().await.unwrap();
        assert_eq!(stats.files_processed, 1);
        assert_eq!(provider.chat_calls(), 0);
        indexer.shutdown().await;
    }

    #[tokio::test]
    async fn search_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = memory_config(dir.path());
        let indexer = build_with_provider(&config, Arc::new(MockProvider::default())).unwrap();
        indexer.shutdown().await;

        let result = indexer.search("anything", 3, &SearchFilters::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn status_reflects_manifest_after_run() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.rs", "fn a() {}\n");
        write(dir.path(), "b.py", "def b():\n    pass\n");
        let config = memory_config(dir.path());

        let before = status(&config);
        assert!(!before.manifest_exists);
        assert_eq!(before.stats.total_files, 0);

        let indexer = build_with_provider(&config, Arc::new(MockProvider::default())).unwrap();
        indexer.run().await.unwrap();
        indexer.shutdown().await;

        let after = status(&config);
        assert!(after.manifest_exists);
        assert_eq!(after.stats.total_files, 2);
        assert_eq!(after.stats.completed, 2);
        assert_eq!(after.stats.failed, 0);
        assert_eq!(after.pending, 0);
        assert!(after.stats.last_run_at.is_some());
    }

    #[tokio::test]
    async fn qdrant_backend_builds_lazily() {
        let config = Config::default();
        assert!(build_store(&config).is_ok());
    }
}
