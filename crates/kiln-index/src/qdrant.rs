//! Qdrant backend for [`VectorStore`].

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    self, Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, PointId, PointStruct, PointsIdsList,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder, point_id::PointIdOptions,
    value::Kind,
};

use crate::vector_store::{
    BoxFuture, Payload, PayloadFilter, ScoredPoint, StoredPoint, VectorStore, VectorStoreError,
};

/// Payload fields indexed as keywords so equality filters stay cheap.
const KEYWORD_FIELDS: [&str; 3] = ["file_path", "language", "chunk_type"];

/// [`VectorStore`] over a gRPC Qdrant client. The connection is made lazily.
#[derive(Clone)]
pub struct QdrantStore {
    client: Qdrant,
    url: String,
}

impl std::fmt::Debug for QdrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantStore")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl QdrantStore {
    /// # Errors
    ///
    /// Returns [`VectorStoreError::Connection`] if `url` is not usable.
    pub fn connect(url: &str) -> Result<Self, VectorStoreError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| VectorStoreError::Connection(format!("{url}: {e}")))?;
        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }

    async fn create(&self, collection: &str, dimension: u64) -> Result<(), VectorStoreError> {
        let err = |e: qdrant_client::QdrantError| VectorStoreError::Collection(e.to_string());
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(dimension, Distance::Cosine)),
            )
            .await
            .map_err(err)?;
        for field in KEYWORD_FIELDS {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    collection,
                    field,
                    FieldType::Keyword,
                ))
                .await
                .map_err(err)?;
        }
        tracing::info!(collection, dimension, "created qdrant collection");
        Ok(())
    }
}

impl VectorStore for QdrantStore {
    fn ensure_collection(
        &self,
        collection: &str,
        dimension: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let exists = self
                .client
                .collection_exists(&collection)
                .await
                .map_err(|e| VectorStoreError::Connection(e.to_string()))?;
            if exists {
                return Ok(());
            }
            self.create(&collection, dimension).await
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<StoredPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let points = points
                .into_iter()
                .map(to_point_struct)
                .collect::<Result<Vec<_>, _>>()?;
            self.client
                .upsert_points(UpsertPointsBuilder::new(&collection, points).wait(true))
                .await
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))?;
            Ok(())
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: PayloadFilter,
    ) -> BoxFuture<'_, Result<Vec<ScoredPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut request = SearchPointsBuilder::new(&collection, vector, limit).with_payload(true);
            if let Some(filter) = to_qdrant_filter(&filter) {
                request = request.filter(filter);
            }
            let response = self
                .client
                .search_points(request)
                .await
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            Ok(response.result.into_iter().map(from_qdrant_hit).collect())
        })
    }

    fn delete(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            let ids = ids.into_iter().map(PointId::from).collect();
            self.client
                .delete_points(DeletePointsBuilder::new(&collection).points(PointsIdsList { ids }))
                .await
                .map_err(|e| VectorStoreError::Delete(e.to_string()))?;
            Ok(())
        })
    }
}

fn to_point_struct(point: StoredPoint) -> Result<PointStruct, VectorStoreError> {
    let StoredPoint {
        id,
        vector,
        payload,
    } = point;
    let payload = qdrant_client::Payload::try_from(serde_json::Value::Object(
        payload.into_iter().collect(),
    ))
    .map_err(|e| VectorStoreError::Upsert(format!("payload of {id}: {e}")))?;
    Ok(PointStruct::new(id, vector, payload))
}

/// `None` for an empty filter, so unfiltered searches send no filter at all.
fn to_qdrant_filter(filter: &PayloadFilter) -> Option<Filter> {
    if filter.is_empty() {
        return None;
    }
    Some(Filter::must(filter.equals.iter().map(|(field, value)| {
        Condition::matches(field.as_str(), value.clone())
    })))
}

fn json_value(value: qdrant::Value) -> Option<serde_json::Value> {
    Some(match value.kind? {
        Kind::StringValue(s) => s.into(),
        Kind::IntegerValue(i) => i.into(),
        Kind::DoubleValue(d) => serde_json::Number::from_f64(d)?.into(),
        Kind::BoolValue(b) => b.into(),
        _ => return None,
    })
}

fn from_qdrant_hit(hit: qdrant::ScoredPoint) -> ScoredPoint {
    let id = match hit.id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };
    let payload: Payload = hit
        .payload
        .into_iter()
        .filter_map(|(key, value)| Some((key, json_value(value)?)))
        .collect();
    ScoredPoint {
        id,
        score: hit.score,
        payload,
    }
}
