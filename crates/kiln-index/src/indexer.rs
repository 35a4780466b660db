//! Incremental indexing run: discover → detect changes → prioritize → chunk →
//! summarize → embed → upsert → record fingerprints.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use kiln_quota::{EMBEDDING, QuotaMetrics, QuotaRateLimiter, SUMMARIZATION};
use serde::Serialize;

use crate::collaborators::{Chunk, Discoverer, Embedder, Parser, Summarizer};
use crate::context::contextualize_for_embedding;
use crate::discovery::{is_excluded, relative_path};
use crate::error::{IndexError, Result};
use crate::fingerprint::{ChunkRecord, ContentFingerprintStore, ProcessingStatus};
use crate::languages::is_indexable;
use crate::priority::{PriorityEntry, PriorityScheduler};
use crate::retry::{RetryPolicy, retry};
use crate::sink::{EmbeddingPoint, RetryingUpsertSink, UpsertReport, point_id};

/// Directory names skipped by discovery unless configured otherwise.
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "dist",
    "build",
    "vendor",
    "__pycache__",
    ".git",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Maximum number of files taken from the priority order per run.
    pub file_budget: Option<usize>,
    pub exclude_dirs: Vec<String>,
    /// Globs matched against file names and relative paths.
    pub exclude_patterns: Vec<String>,
    pub summarize: bool,
    /// Caller-side retries around summarize and embed submissions.
    pub retry: RetryPolicy,
    pub sink_batch_size: usize,
    pub sink_max_retries: u32,
    /// Embedding batches submitted concurrently per wave.
    pub embed_batches_in_flight: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            file_budget: None,
            exclude_dirs: DEFAULT_EXCLUDE_DIRS.iter().map(|d| (*d).to_owned()).collect(),
            exclude_patterns: Vec::new(),
            summarize: true,
            retry: RetryPolicy::default(),
            sink_batch_size: 64,
            sink_max_retries: 3,
            embed_batches_in_flight: 4,
        }
    }
}

/// External collaborators driven by the pipeline.
pub struct Collaborators {
    pub discoverer: Box<dyn Discoverer>,
    pub parser: Box<dyn Parser>,
    /// `None` disables summarization regardless of config.
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub embedder: Arc<dyn Embedder>,
}

/// Statistics of one [`IndexPipeline::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub files_discovered: usize,
    pub files_changed: usize,
    /// Changed files left for a later run by the file budget.
    pub files_deferred: usize,
    /// Worklist files that were already current.
    pub files_up_to_date: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub files_removed: usize,
    /// `chunks_generated == chunks_cached + chunks_embedded + chunks_failed`.
    pub chunks_generated: usize,
    pub chunks_cached: usize,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
    pub summaries_generated: usize,
    pub summaries_cached: usize,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub upsert: UpsertReport,
    pub quotas: Vec<QuotaMetrics>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkState {
    /// Stored point is current; nothing to do.
    Cached,
    Pending,
    Stored,
    Failed,
}

struct ChunkWork {
    chunk: Chunk,
    summary: Option<String>,
    vector: Option<Vec<f32>>,
    state: ChunkState,
}

struct FileWork {
    path: String,
    priority: u32,
    bytes: Vec<u8>,
    language: Option<String>,
    chunks: Vec<ChunkWork>,
}

impl FileWork {
    fn succeeded(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| matches!(c.state, ChunkState::Cached | ChunkState::Stored))
    }
}

/// Decides which filesystem events may affect the index.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    manifest: Option<String>,
    exclude_dirs: Vec<String>,
    exclude_patterns: Vec<glob::Pattern>,
}

impl WatchFilter {
    /// Same filter resolved against another spelling of the root (e.g. canonical).
    #[must_use]
    pub fn rooted_at(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    #[must_use]
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(rel) = relative_path(&self.root, path) else {
            return false;
        };
        if self
            .manifest
            .as_deref()
            .is_some_and(|m| rel == m || rel.starts_with(&format!("{m}.")))
        {
            return false;
        }
        let mut dirs = rel.split('/').rev().skip(1);
        if dirs.any(|d| d.starts_with('.') || self.exclude_dirs.iter().any(|x| x == d)) {
            return false;
        }
        is_indexable(path) && !is_excluded(&rel, &self.exclude_patterns)
    }
}

/// Sequences one incremental indexing run over a repository.
pub struct IndexPipeline {
    fingerprints: ContentFingerprintStore,
    scheduler: PriorityScheduler,
    limiter: QuotaRateLimiter,
    sink: Arc<RetryingUpsertSink>,
    collaborators: Collaborators,
    config: PipelineConfig,
    exclude_patterns: Vec<glob::Pattern>,
    manifest_rel: Option<String>,
}

impl std::fmt::Debug for IndexPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexPipeline")
            .field("root", &self.fingerprints.root())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize, empty: f64) -> f64 {
    if denominator == 0 {
        empty
    } else {
        numerator as f64 / denominator as f64
    }
}

fn point_metadata(chunk: &Chunk) -> BTreeMap<String, serde_json::Value> {
    let mut m = BTreeMap::new();
    m.insert("file_path".into(), chunk.file_path.clone().into());
    if let Some(lang) = &chunk.language {
        m.insert("language".into(), lang.clone().into());
    }
    m.insert("chunk_type".into(), chunk.chunk_type.clone().into());
    if let Some(symbol) = &chunk.symbol_name {
        m.insert("symbol_name".into(), symbol.clone().into());
    }
    m.insert("start_line".into(), chunk.start_line.into());
    m.insert("end_line".into(), chunk.end_line.into());
    m.insert("token_count".into(), chunk.token_count.into());
    m.insert("content_hash".into(), chunk.content_hash().into());
    m
}

impl IndexPipeline {
    /// # Errors
    ///
    /// Returns an error if an exclude pattern is not a valid glob.
    pub fn new(
        fingerprints: ContentFingerprintStore,
        scheduler: PriorityScheduler,
        limiter: QuotaRateLimiter,
        sink: Arc<RetryingUpsertSink>,
        collaborators: Collaborators,
        config: PipelineConfig,
    ) -> Result<Self> {
        let exclude_patterns = config
            .exclude_patterns
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let manifest_rel = relative_path(fingerprints.root(), fingerprints.manifest_path());
        Ok(Self {
            fingerprints,
            scheduler,
            limiter,
            sink,
            collaborators,
            config,
            exclude_patterns,
            manifest_rel,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.fingerprints.root()
    }

    #[must_use]
    pub fn fingerprints(&self) -> &ContentFingerprintStore {
        &self.fingerprints
    }

    #[must_use]
    pub fn limiter(&self) -> &QuotaRateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<RetryingUpsertSink> {
        &self.sink
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn watch_filter(&self) -> WatchFilter {
        WatchFilter {
            root: self.fingerprints.root().to_path_buf(),
            manifest: self.manifest_rel.clone(),
            exclude_dirs: self.config.exclude_dirs.clone(),
            exclude_patterns: self.exclude_patterns.clone(),
        }
    }

    /// Run one incremental pass and save the manifest once at the end.
    ///
    /// Per-file failures are counted in the returned stats. Only fatal errors
    /// (limiter lifecycle misuse, an embedding dimension mismatch, an
    /// unwalkable root) abort the run, in which case the manifest is not saved.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error.
    pub async fn run(&mut self) -> Result<RunStats> {
        let started = Instant::now();
        let mut stats = RunStats::default();
        let mut orphans: Vec<String> = Vec::new();

        let mut discovered = self.collaborators.discoverer.discover(
            self.fingerprints.root(),
            &self.config.exclude_dirs,
            &self.exclude_patterns,
        )?;
        if let Some(manifest) = &self.manifest_rel {
            discovered.retain(|p| p != manifest);
        }
        stats.files_discovered = discovered.len();

        let pruned = self
            .fingerprints
            .prune_deleted(discovered.iter().map(String::as_str));
        stats.files_removed = pruned.files.len();
        orphans.extend(pruned.chunk_ids);

        let changed = self
            .fingerprints
            .changed_files(discovered.iter().map(String::as_str));
        stats.files_changed = changed.len();

        let worklist = self
            .scheduler
            .top_n(&discovered, &changed, self.config.file_budget);
        let (todo, current): (Vec<PriorityEntry>, Vec<PriorityEntry>) =
            worklist.into_iter().partition(|e| e.is_changed);
        stats.files_up_to_date = current.len();
        stats.files_deferred = changed.len() - todo.len();
        let reused_chunks: usize = current
            .iter()
            .filter_map(|e| self.fingerprints.file(&e.path))
            .map(|fp| fp.chunk_count)
            .sum();

        tracing::info!(
            discovered = stats.files_discovered,
            changed = stats.files_changed,
            worklist = todo.len(),
            removed = stats.files_removed,
            "index run started"
        );

        let mut files = Vec::with_capacity(todo.len());
        for entry in &todo {
            if let Some(work) = self.load_file(entry, &mut stats).await {
                files.push(work);
            }
        }
        stats.chunks_generated = files.iter().map(|f| f.chunks.len()).sum();

        self.summarize_all(&mut files, &mut stats).await?;
        self.embed_all(&mut files, &mut stats).await?;
        stats.upsert = self.store_all(&mut files).await;

        for work in files {
            self.finish_file(work, &mut stats, &mut orphans);
        }

        if !orphans.is_empty() {
            if let Err(e) = self.sink.delete_points(&orphans).await {
                tracing::warn!(points = orphans.len(), "stale point cleanup failed: {e}");
                stats.errors.push(format!("stale point cleanup: {e}"));
            } else {
                tracing::debug!(points = orphans.len(), "stale points deleted");
            }
        }

        let completed = stats.chunks_cached + stats.chunks_embedded;
        stats.success_rate = ratio(completed, stats.chunks_generated, 1.0);
        stats.cache_hit_rate = ratio(
            stats.chunks_cached + reused_chunks,
            stats.chunks_generated + reused_chunks,
            0.0,
        );
        self.fingerprints.record_run(stats.cache_hit_rate);
        if let Err(e) = self.fingerprints.save() {
            tracing::warn!(
                path = %self.fingerprints.manifest_path().display(),
                "manifest save failed: {e}"
            );
            stats.errors.push(format!("manifest save: {e}"));
        }

        stats.quotas = self.limiter.all_metrics();
        stats.duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        tracing::info!(
            processed = stats.files_processed,
            failed = stats.files_failed,
            chunks = stats.chunks_generated,
            cached = stats.chunks_cached,
            embedded = stats.chunks_embedded,
            duration_ms = stats.duration_ms,
            "index run finished"
        );
        Ok(stats)
    }

    /// Read and chunk one file. Failures are recorded and yield `None`.
    async fn load_file(&mut self, entry: &PriorityEntry, stats: &mut RunStats) -> Option<FileWork> {
        let path = &entry.path;
        let bytes = match tokio::fs::read(self.fingerprints.root().join(path)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(file = %path, "read failed: {e}");
                stats.files_failed += 1;
                stats.errors.push(format!("{path}: {e}"));
                return None;
            }
        };

        let parsed = std::str::from_utf8(&bytes)
            .map_err(|e| IndexError::Parse(format!("{path}: not UTF-8: {e}")))
            .and_then(|source| self.collaborators.parser.parse(path, source));
        let chunks = match parsed {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(file = %path, "parse failed: {e}");
                self.fingerprints.mark_failed(path, &bytes);
                stats.files_failed += 1;
                stats.errors.push(format!("{path}: {e}"));
                return None;
            }
        };

        let chunks = chunks
            .into_iter()
            .map(|chunk| {
                let hash = chunk.content_hash();
                let cached = self.fingerprints.cached_chunk(&chunk.id, &hash);
                let state = if cached.is_some_and(|c| {
                    c.status == ProcessingStatus::Completed && c.embedding_ref.is_some()
                }) {
                    ChunkState::Cached
                } else {
                    ChunkState::Pending
                };
                let summary = cached.and_then(|c| c.summary.clone());
                if summary.is_some() {
                    stats.summaries_cached += 1;
                }
                ChunkWork {
                    chunk,
                    summary,
                    vector: None,
                    state,
                }
            })
            .collect::<Vec<_>>();

        let language = chunks.iter().find_map(|c| c.chunk.language.clone());
        Some(FileWork {
            path: path.clone(),
            priority: entry.priority,
            bytes,
            language,
            chunks,
        })
    }

    async fn summarize_chunk(
        &self,
        summarizer: &Arc<dyn Summarizer>,
        chunk: &Chunk,
        priority: u32,
    ) -> Result<String> {
        retry(&self.config.retry, "summarize", || {
            let summarizer = Arc::clone(summarizer);
            let chunk = chunk.clone();
            let limiter = self.limiter.clone();
            async move {
                limiter
                    .submit(SUMMARIZATION, priority, async move {
                        summarizer.summarize(&chunk).await
                    })
                    .await?
            }
        })
        .await
    }

    async fn summarize_all(&self, files: &mut [FileWork], stats: &mut RunStats) -> Result<()> {
        if !self.config.summarize {
            return Ok(());
        }
        let Some(summarizer) = &self.collaborators.summarizer else {
            return Ok(());
        };

        let targets: Vec<(usize, usize)> = files
            .iter()
            .enumerate()
            .flat_map(|(fi, f)| {
                f.chunks
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.state == ChunkState::Pending && c.summary.is_none())
                    .map(move |(ci, _)| (fi, ci))
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let results = join_all(targets.iter().map(|&(fi, ci)| {
            self.summarize_chunk(summarizer, &files[fi].chunks[ci].chunk, files[fi].priority)
        }))
        .await;

        for ((fi, ci), result) in targets.into_iter().zip(results) {
            let work = &mut files[fi].chunks[ci];
            match result {
                Ok(summary) => {
                    stats.summaries_generated += 1;
                    work.summary = Some(summary);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(chunk = %work.chunk.id, "summarize failed: {e}");
                    stats.errors.push(format!("{}: summarize: {e}", work.chunk.id));
                    work.state = ChunkState::Failed;
                }
            }
        }
        Ok(())
    }

    async fn embed_texts(&self, texts: Vec<String>, priority: u32) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let texts = Arc::new(texts);
        let vectors = retry(&self.config.retry, "embed", || {
            let embedder = Arc::clone(&self.collaborators.embedder);
            let texts = Arc::clone(&texts);
            let limiter = self.limiter.clone();
            async move {
                limiter
                    .submit(EMBEDDING, priority, async move {
                        embedder.embed_batch(&texts).await
                    })
                    .await?
            }
        })
        .await?;

        if vectors.len() != expected {
            return Err(IndexError::EmbeddingCount {
                expected,
                actual: vectors.len(),
            });
        }
        if let Some(first) = vectors.first() {
            let dimension = first.len() as u64;
            if let Some(bad) = vectors.iter().find(|v| v.len() as u64 != dimension) {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    actual: bad.len() as u64,
                });
            }
            self.sink.ensure_collection(dimension).await?;
        }
        Ok(vectors)
    }

    /// Embed pending chunks in waves of concurrent batches sized by the limiter.
    async fn embed_all(&self, files: &mut [FileWork], stats: &mut RunStats) -> Result<()> {
        let queue: Vec<(usize, usize)> = files
            .iter()
            .enumerate()
            .flat_map(|(fi, f)| {
                f.chunks
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.state == ChunkState::Pending)
                    .map(move |(ci, _)| (fi, ci))
            })
            .collect();

        let mut offset = 0;
        while offset < queue.len() {
            let batch_size = self.limiter.adaptive_batch_size(EMBEDDING)?.max(1);
            let mut wave = Vec::new();
            while wave.len() < self.config.embed_batches_in_flight.max(1) && offset < queue.len() {
                let end = (offset + batch_size).min(queue.len());
                wave.push(&queue[offset..end]);
                offset = end;
            }

            let results = join_all(wave.iter().map(|batch| {
                let texts = batch
                    .iter()
                    .map(|&(fi, ci)| {
                        let work = &files[fi].chunks[ci];
                        contextualize_for_embedding(&work.chunk, work.summary.as_deref())
                    })
                    .collect();
                let priority = batch
                    .iter()
                    .map(|&(fi, _)| files[fi].priority)
                    .min()
                    .unwrap_or_default();
                self.embed_texts(texts, priority)
            }))
            .await;

            for (batch, result) in wave.into_iter().zip(results) {
                match result {
                    Ok(vectors) => {
                        for (&(fi, ci), vector) in batch.iter().zip(vectors) {
                            files[fi].chunks[ci].vector = Some(vector);
                        }
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(chunks = batch.len(), "embedding batch failed: {e}");
                        stats.errors.push(format!("embed {} chunks: {e}", batch.len()));
                        for &(fi, ci) in batch {
                            files[fi].chunks[ci].state = ChunkState::Failed;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn store_all(&self, files: &mut [FileWork]) -> UpsertReport {
        let mut points = Vec::new();
        for work in files.iter_mut().flat_map(|f| f.chunks.iter_mut()) {
            if let Some(vector) = work.vector.take() {
                points.push(EmbeddingPoint {
                    chunk_id: work.chunk.id.clone(),
                    vector,
                    content: work.chunk.content.clone(),
                    summary: work.summary.clone(),
                    metadata: point_metadata(&work.chunk),
                });
                work.state = ChunkState::Stored;
            }
        }
        if points.is_empty() {
            return UpsertReport::default();
        }

        let report = self
            .sink
            .upsert_batch(
                points,
                self.config.sink_batch_size,
                self.config.sink_max_retries,
            )
            .await;
        let failed: HashSet<&str> = report.failed_ids.iter().map(String::as_str).collect();
        for work in files.iter_mut().flat_map(|f| f.chunks.iter_mut()) {
            if work.state == ChunkState::Stored && failed.contains(work.chunk.id.as_str()) {
                work.state = ChunkState::Failed;
            }
        }
        report
    }

    /// Write fingerprints for one file once all of its chunks are settled.
    fn finish_file(&mut self, work: FileWork, stats: &mut RunStats, orphans: &mut Vec<String>) {
        let succeeded = work.succeeded();
        let mut chunk_ids = Vec::with_capacity(work.chunks.len());
        let mut failed_chunks = 0;

        for (index, c) in work.chunks.into_iter().enumerate() {
            let status = match c.state {
                ChunkState::Cached => {
                    stats.chunks_cached += 1;
                    ProcessingStatus::Completed
                }
                ChunkState::Stored => {
                    stats.chunks_embedded += 1;
                    ProcessingStatus::Completed
                }
                ChunkState::Pending | ChunkState::Failed => {
                    failed_chunks += 1;
                    ProcessingStatus::Failed
                }
            };
            let embedding_ref =
                (status == ProcessingStatus::Completed).then(|| point_id(&c.chunk.id));
            self.fingerprints.record_chunk(ChunkRecord {
                chunk_id: &c.chunk.id,
                file_path: &work.path,
                content: &c.chunk.content,
                index,
                summary: c.summary,
                embedding_ref,
                status,
            });
            chunk_ids.push(c.chunk.id);
        }
        stats.chunks_failed += failed_chunks;

        if succeeded {
            let count = chunk_ids.len();
            let removed = self.fingerprints.record_file_content(
                &work.path,
                &work.bytes,
                work.language.as_deref(),
                chunk_ids,
                ProcessingStatus::Completed,
            );
            tracing::debug!(file = %work.path, chunks = count, stale = removed.len(), "file indexed");
            orphans.extend(removed);
            stats.files_processed += 1;
        } else {
            tracing::warn!(file = %work.path, failed_chunks, "file left incomplete");
            // Keep referencing the previous chunk IDs so their points are cleaned
            // up once the file finally completes.
            let previous: Vec<String> = self
                .fingerprints
                .file(&work.path)
                .map(|fp| fp.chunk_ids.clone())
                .unwrap_or_default();
            for id in previous {
                if !chunk_ids.contains(&id) {
                    chunk_ids.push(id);
                }
            }
            self.fingerprints.record_file_content(
                &work.path,
                &work.bytes,
                work.language.as_deref(),
                chunk_ids,
                ProcessingStatus::Failed,
            );
            stats.files_failed += 1;
        }
    }
}
