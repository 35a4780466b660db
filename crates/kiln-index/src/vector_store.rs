//! Storage seam between [`RetryingUpsertSink`](crate::sink::RetryingUpsertSink)
//! and a vector database.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Payload = HashMap<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("collection error: {0}")]
    Collection(String),
    #[error("upsert error: {0}")]
    Upsert(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("delete error: {0}")]
    Delete(String),
}

/// A point as stored: UUID, vector and JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Exact string matches on payload fields; every pair must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadFilter {
    pub equals: Vec<(String, String)>,
}

impl PayloadFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    #[must_use]
    pub fn matches(&self, payload: &Payload) -> bool {
        self.equals
            .iter()
            .all(|(field, want)| payload.get(field).and_then(|v| v.as_str()) == Some(want))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PayloadFilter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            equals: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Backend operations the sink needs. Object safe, so backends can be swapped at runtime.
pub trait VectorStore: Send + Sync {
    /// Create `collection` for `dimension`-sized vectors under cosine distance.
    /// A no-op when it already exists.
    fn ensure_collection(
        &self,
        collection: &str,
        dimension: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Insert or replace points by ID.
    fn upsert(
        &self,
        collection: &str,
        points: Vec<StoredPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Up to `limit` points ordered by descending similarity to `vector`.
    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: PayloadFilter,
    ) -> BoxFuture<'_, Result<Vec<ScoredPoint>, VectorStoreError>>;

    fn delete(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;
}
