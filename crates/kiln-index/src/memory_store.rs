use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::vector_store::{
    BoxFuture, Payload, PayloadFilter, ScoredPoint, StoredPoint, VectorStore, VectorStoreError,
};

#[derive(Default)]
struct Collection {
    dimension: u64,
    /// Keyed by point ID; ordered so equal scores come back deterministically.
    points: BTreeMap<String, (Vec<f32>, Payload)>,
}

/// Process-local vector store for tests and `backend = "memory"`.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore")
            .field("collections", &self.read().len())
            .finish()
    }
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Collection>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Collection>> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of points in `collection`, zero if it does not exist.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.read().get(collection).map_or(0, |c| c.points.len())
    }

    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    #[must_use]
    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.read()
            .get(collection)
            .is_some_and(|c| c.points.contains_key(id))
    }

    /// Payload stored for `id`, if any.
    #[must_use]
    pub fn payload(&self, collection: &str, id: &str) -> Option<Payload> {
        self.read()
            .get(collection)
            .and_then(|c| c.points.get(id))
            .map(|(_, payload)| payload.clone())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

impl VectorStore for InMemoryVectorStore {
    fn ensure_collection(
        &self,
        collection: &str,
        dimension: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let mut cols = self.write();
        cols.entry(collection.to_owned())
            .or_insert_with(|| Collection {
                dimension,
                points: BTreeMap::new(),
            });
        Box::pin(async { Ok(()) })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<StoredPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let result = (|| {
            let mut cols = self.write();
            let Some(col) = cols.get_mut(collection) else {
                return Err(VectorStoreError::Upsert(format!(
                    "collection {collection} not found"
                )));
            };
            if let Some(bad) = points
                .iter()
                .find(|p| p.vector.len() as u64 != col.dimension)
            {
                return Err(VectorStoreError::Upsert(format!(
                    "point {} has dimension {}, collection expects {}",
                    bad.id,
                    bad.vector.len(),
                    col.dimension
                )));
            }
            col.points
                .extend(points.into_iter().map(|p| (p.id, (p.vector, p.payload))));
            Ok(())
        })();
        Box::pin(async move { result })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: PayloadFilter,
    ) -> BoxFuture<'_, Result<Vec<ScoredPoint>, VectorStoreError>> {
        let result = self
            .read()
            .get(collection)
            .map(|col| {
                let mut hits: Vec<ScoredPoint> = col
                    .points
                    .iter()
                    .filter(|(_, (_, payload))| filter.matches(payload))
                    .map(|(id, (v, payload))| ScoredPoint {
                        id: id.clone(),
                        score: cosine(&vector, v),
                        payload: payload.clone(),
                    })
                    .collect();
                // Stable sort keeps ID order among equal scores.
                hits.sort_by(|a, b| b.score.total_cmp(&a.score));
                hits.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
                hits
            })
            .ok_or_else(|| VectorStoreError::Search(format!("collection {collection} not found")));
        Box::pin(async move { result })
    }

    fn delete(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        if let Some(col) = self.write().get_mut(collection) {
            for id in &ids {
                col.points.remove(id);
            }
        }
        Box::pin(async { Ok(()) })
    }
}
