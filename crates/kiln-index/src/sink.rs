//! Batched, retrying writes of embedded chunks to a [`VectorStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::retry::{RetryPolicy, retry};
use crate::vector_store::{Payload, PayloadFilter, ScoredPoint, StoredPoint, VectorStore};

/// Over-fetch factor applied to searches that post-filter by path glob.
const POST_FILTER_OVERFETCH: usize = 5;

/// One embedded chunk on its way to the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingPoint {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub summary: Option<String>,
    /// File path, language, chunk type, symbol name, line range, token count.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Deterministic vector-store point ID for a chunk.
#[must_use]
pub fn point_id(chunk_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
}

impl EmbeddingPoint {
    fn into_stored_point(self) -> StoredPoint {
        let mut payload: Payload = self.metadata.into_iter().collect();
        payload.insert("chunk_id".into(), self.chunk_id.clone().into());
        payload.insert("content".into(), self.content.into());
        if let Some(summary) = self.summary {
            payload.insert("summary".into(), summary.into());
        }
        StoredPoint {
            id: point_id(&self.chunk_id),
            vector: self.vector,
            payload,
        }
    }
}

/// Outcome of [`RetryingUpsertSink::upsert_batch`]. `successful + failed == total`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    /// Chunk IDs whose batch exhausted its retries.
    pub failed_ids: Vec<String>,
}

impl UpsertReport {
    #[allow(clippy::cast_precision_loss)]
    fn finish(mut self) -> Self {
        debug_assert_eq!(self.successful + self.failed, self.total);
        self.success_rate = if self.total == 0 {
            1.0
        } else {
            self.successful as f64 / self.total as f64
        };
        self
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: UpsertReport) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
        self.failed_ids.extend(other.failed_ids);
        *self = std::mem::take(self).finish();
    }
}

/// Exact-match payload filters plus an optional glob over the file path.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub equals: BTreeMap<String, String>,
    pub path_glob: Option<glob::Pattern>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
    pub file_path: String,
    pub language: Option<String>,
    pub chunk_type: Option<String>,
    pub symbol_name: Option<String>,
    pub start_line: Option<u64>,
    pub end_line: Option<u64>,
    pub summary: Option<String>,
    pub content: String,
}

impl SearchHit {
    fn from_scored(point: ScoredPoint) -> Self {
        let text = |key: &str| {
            point
                .payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_owned)
        };
        let line = |key: &str| point.payload.get(key).and_then(serde_json::Value::as_u64);
        Self {
            chunk_id: text("chunk_id").unwrap_or_else(|| point.id.clone()),
            score: point.score,
            file_path: text("file_path").unwrap_or_default(),
            language: text("language"),
            chunk_type: text("chunk_type"),
            symbol_name: text("symbol_name"),
            start_line: line("start_line"),
            end_line: line("end_line"),
            summary: text("summary"),
            content: text("content").unwrap_or_default(),
        }
    }

    /// `path :: symbol (lines a-b)` for display.
    #[must_use]
    pub fn header(&self) -> String {
        let name = self
            .symbol_name
            .as_deref()
            .or(self.chunk_type.as_deref())
            .unwrap_or("chunk");
        match (self.start_line, self.end_line) {
            (Some(start), Some(end)) => format!("{} :: {name} (lines {start}-{end})", self.file_path),
            _ => format!("{} :: {name}", self.file_path),
        }
    }
}

/// Writes [`EmbeddingPoint`]s in bounded batches with retry and partial-failure accounting.
///
/// A sink is the single writer for its collection.
pub struct RetryingUpsertSink {
    store: Arc<dyn VectorStore>,
    collection: String,
    backoff: RetryPolicy,
    expected_dimension: Option<u64>,
    ready: OnceCell<u64>,
}

impl std::fmt::Debug for RetryingUpsertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingUpsertSink")
            .field("collection", &self.collection)
            .field("expected_dimension", &self.expected_dimension)
            .finish_non_exhaustive()
    }
}

impl RetryingUpsertSink {
    /// `backoff` supplies the delays between attempts; attempt counts are per call.
    #[must_use]
    pub fn new(
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        backoff: RetryPolicy,
        expected_dimension: Option<u64>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            backoff,
            expected_dimension,
            ready: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create the collection for `dimension`-sized vectors on first use.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DimensionMismatch`] if `dimension` disagrees with the
    /// configured dimension or the one the collection was set up with, or the
    /// store error if creation keeps failing.
    pub async fn ensure_collection(&self, dimension: u64) -> Result<()> {
        if let Some(expected) = self.expected_dimension
            && expected != dimension
        {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: dimension,
            });
        }
        let ready = self
            .ready
            .get_or_try_init(|| async {
                retry(&self.backoff, "ensure collection", move || async move {
                    self.store
                        .ensure_collection(&self.collection, dimension)
                        .await
                        .map_err(IndexError::from)
                })
                .await?;
                Ok::<_, IndexError>(dimension)
            })
            .await?;
        if *ready != dimension {
            return Err(IndexError::DimensionMismatch {
                expected: *ready,
                actual: dimension,
            });
        }
        Ok(())
    }

    /// Write `points` in chunks of `batch_size`, each tried up to `max_retries` times.
    ///
    /// A batch that exhausts its attempts is counted as failed; later batches
    /// are still attempted.
    pub async fn upsert_batch(
        &self,
        points: Vec<EmbeddingPoint>,
        batch_size: usize,
        max_retries: u32,
    ) -> UpsertReport {
        let policy = RetryPolicy {
            max_retries,
            ..self.backoff
        };
        let mut report = UpsertReport {
            total: points.len(),
            ..UpsertReport::default()
        };

        let mut points = points.into_iter().peekable();
        let batch_size = batch_size.max(1);
        while points.peek().is_some() {
            let batch: Vec<EmbeddingPoint> = points.by_ref().take(batch_size).collect();
            let chunk_ids: Vec<String> = batch.iter().map(|p| p.chunk_id.clone()).collect();
            let stored: Vec<StoredPoint> = batch
                .into_iter()
                .map(EmbeddingPoint::into_stored_point)
                .collect();

            let written = retry(&policy, "upsert batch", move || {
                let stored = stored.clone();
                async move {
                    self.store
                        .upsert(&self.collection, stored)
                        .await
                        .map_err(IndexError::from)
                }
            })
            .await;

            match written {
                Ok(()) => report.successful += chunk_ids.len(),
                Err(e) => {
                    tracing::warn!(
                        collection = %self.collection,
                        points = chunk_ids.len(),
                        "upsert batch failed after {max_retries} attempts: {e}"
                    );
                    report.failed += chunk_ids.len();
                    report.failed_ids.extend(chunk_ids);
                }
            }
        }
        report.finish()
    }

    /// Nearest neighbours of `query`, optionally filtered.
    ///
    /// With a path glob, `limit * 5` candidates are fetched and filtered
    /// client-side so that up to `limit` hits survive.
    ///
    /// # Errors
    ///
    /// Returns an error if the store search fails.
    pub async fn search(
        &self,
        query: Vec<f32>,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let fetch = if filters.path_glob.is_some() {
            limit.saturating_mul(POST_FILTER_OVERFETCH)
        } else {
            limit
        };
        let filter: PayloadFilter = filters
            .equals
            .iter()
            .map(|(field, value)| (field.as_str(), value.as_str()))
            .collect();

        let scored = self
            .store
            .search(
                &self.collection,
                query,
                u64::try_from(fetch).unwrap_or(u64::MAX),
                filter,
            )
            .await?;
        Ok(scored
            .into_iter()
            .map(SearchHit::from_scored)
            .filter(|hit| {
                filters
                    .path_glob
                    .as_ref()
                    .is_none_or(|g| g.matches(&hit.file_path))
            })
            .take(limit)
            .collect())
    }

    /// Remove the points of `chunk_ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn delete_points(&self, chunk_ids: &[String]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let ids = chunk_ids.iter().map(|id| point_id(id)).collect();
        self.store.delete(&self.collection, ids).await?;
        Ok(())
    }
}
