//! Qdrant-backed [`VectorIndexStore`].
//!
//! Point ids in qdrant must be numeric or UUID, so user ids are mapped to
//! deterministic v5 UUIDs under a configurable namespace; the canonical
//! `userId` always travels in the payload and is the value read back out.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::Payload;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    self, Condition, CreateCollectionBuilder, Distance, Filter, GetPointsBuilder, PointId,
    PointStruct, PointsIdsList, SearchPointsBuilder, SetPayloadPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use uuid::Uuid;

use crate::error::{MatchingError, MatchingResult};
use crate::index::{ScoredUserPoint, UserPoint, VectorIndexStore};
use crate::models::MatchMetadata;

/// Connection settings for the qdrant store.
#[derive(Clone, Debug)]
pub struct QdrantStoreConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub dimension: usize,
    /// Seed for deterministic point-id derivation. Changing it orphans
    /// every existing point.
    pub namespace: String,
    pub timeout_secs: u64,
}

pub struct QdrantIndexStore {
    client: Qdrant,
    collection: String,
    dimension: usize,
    id_namespace: Uuid,
}

impl QdrantIndexStore {
    pub fn new(config: QdrantStoreConfig) -> MatchingResult<Self> {
        let mut builder = Qdrant::from_url(&config.url);

        if let Some(api_key) = config.api_key {
            builder = builder.api_key(api_key);
        }
        builder = builder.timeout(Duration::from_secs(config.timeout_secs));

        let client = builder
            .build()
            .map_err(|e| MatchingError::IndexWrite(format!("failed to build client: {}", e)))?;

        Ok(Self {
            client,
            collection: config.collection,
            dimension: config.dimension,
            id_namespace: Uuid::new_v5(&Uuid::NAMESPACE_OID, config.namespace.as_bytes()),
        })
    }

    /// Create the collection if it does not exist yet (cosine distance,
    /// configured dimension).
    pub async fn ensure_collection(&self) -> MatchingResult<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| MatchingError::IndexRead(e.to_string()))?;
        if exists {
            return Ok(());
        }

        tracing::info!(collection = %self.collection, dimension = self.dimension, "Creating collection");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(
                    VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                ),
            )
            .await
            .map_err(|e| MatchingError::IndexWrite(e.to_string()))?;
        Ok(())
    }

    fn point_id(&self, user_id: &str) -> PointId {
        PointId::from(Uuid::new_v5(&self.id_namespace, user_id.as_bytes()).to_string())
    }

    fn seeking_filter() -> Filter {
        Filter::must([Condition::matches("seekingMatch", true)])
    }

    fn metadata_to_payload(metadata: &MatchMetadata) -> MatchingResult<HashMap<String, QdrantValue>> {
        let value = serde_json::to_value(metadata)
            .map_err(|e| MatchingError::IndexWrite(e.to_string()))?;

        let mut payload = HashMap::new();
        if let serde_json::Value::Object(map) = value {
            for (key, val) in map {
                if let Some(qdrant_val) = json_to_qdrant_value(val) {
                    payload.insert(key, qdrant_val);
                }
            }
        }
        Ok(payload)
    }

    fn payload_to_metadata(payload: HashMap<String, QdrantValue>) -> MatchMetadata {
        let mut map = serde_json::Map::new();
        for (key, val) in payload {
            if let Some(json_val) = qdrant_value_to_json(val) {
                map.insert(key, json_val);
            }
        }

        let user_id = map
            .get("userId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        MatchMetadata::from_untrusted(&user_id, &map)
    }

    /// Note: the `data` field is deprecated upstream but still the stable
    /// accessor for dense vectors in this client version.
    #[allow(deprecated)]
    fn extract_vector(vectors: &Option<qdrant::VectorsOutput>) -> Option<Vec<f32>> {
        match vectors {
            Some(qdrant::VectorsOutput {
                vectors_options: Some(opts),
            }) => match opts {
                qdrant::vectors_output::VectorsOptions::Vector(v) => Some(v.data.clone()),
                qdrant::vectors_output::VectorsOptions::Vectors(map) => {
                    map.vectors.values().next().map(|v| v.data.clone())
                }
            },
            _ => None,
        }
    }
}

fn json_to_qdrant_value(val: serde_json::Value) -> Option<QdrantValue> {
    match val {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(QdrantValue::from(b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(QdrantValue::from(i))
            } else {
                n.as_f64().map(QdrantValue::from)
            }
        }
        serde_json::Value::String(s) => Some(QdrantValue::from(s)),
        other => Some(QdrantValue::from(other.to_string())),
    }
}

fn qdrant_value_to_json(val: QdrantValue) -> Option<serde_json::Value> {
    use qdrant::value::Kind;

    match val.kind {
        Some(Kind::NullValue(_)) => Some(serde_json::Value::Null),
        Some(Kind::BoolValue(b)) => Some(serde_json::Value::Bool(b)),
        Some(Kind::IntegerValue(i)) => Some(serde_json::Value::Number(i.into())),
        Some(Kind::DoubleValue(f)) => {
            serde_json::Number::from_f64(f).map(serde_json::Value::Number)
        }
        Some(Kind::StringValue(s)) => Some(serde_json::Value::String(s)),
        _ => None,
    }
}

#[async_trait]
impl VectorIndexStore for QdrantIndexStore {
    async fn upsert(&self, point: UserPoint) -> MatchingResult<()> {
        let Some(vector) = point.vector else {
            return Err(MatchingError::IndexWrite(format!(
                "upsert for {} has no vector",
                point.user_id
            )));
        };

        let payload = Self::metadata_to_payload(&point.metadata)?;
        let qdrant_point = PointStruct::new(self.point_id(&point.user_id), vector, payload);

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(&self.collection, vec![qdrant_point]).wait(true),
            )
            .await
            .map_err(|e| MatchingError::IndexWrite(e.to_string()))?;

        tracing::debug!(user_id = %point.user_id, "Upserted vector");
        Ok(())
    }

    async fn fetch(&self, ids: &[String], include_vectors: bool) -> MatchingResult<Vec<UserPoint>> {
        let point_ids: Vec<PointId> = ids.iter().map(|id| self.point_id(id)).collect();

        let results = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, point_ids)
                    .with_vectors(include_vectors)
                    .with_payload(true),
            )
            .await
            .map_err(|e| MatchingError::IndexRead(e.to_string()))?;

        Ok(results
            .result
            .into_iter()
            .map(|point| {
                let vector = include_vectors
                    .then(|| Self::extract_vector(&point.vectors))
                    .flatten();
                let metadata = Self::payload_to_metadata(point.payload);
                UserPoint {
                    user_id: metadata.user_id.clone(),
                    vector,
                    metadata,
                }
            })
            .collect())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        top_k: u64,
        seeking_only: bool,
        include_vectors: bool,
    ) -> MatchingResult<Vec<ScoredUserPoint>> {
        let mut builder = SearchPointsBuilder::new(&self.collection, vector, top_k)
            .with_vectors(include_vectors)
            .with_payload(true);

        if seeking_only {
            builder = builder.filter(Self::seeking_filter());
        }

        let results = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| MatchingError::IndexRead(e.to_string()))?;

        Ok(results
            .result
            .into_iter()
            .map(|point| {
                let vector = include_vectors
                    .then(|| Self::extract_vector(&point.vectors))
                    .flatten();
                let metadata = Self::payload_to_metadata(point.payload);
                ScoredUserPoint {
                    score: point.score,
                    point: UserPoint {
                        user_id: metadata.user_id.clone(),
                        vector,
                        metadata,
                    },
                }
            })
            .collect())
    }

    async fn overwrite_metadata(
        &self,
        user_id: &str,
        metadata: &MatchMetadata,
    ) -> MatchingResult<()> {
        // Overwrite, not merge: the whole payload becomes exactly this
        // object, so fields outside the local model are dropped.
        let payload: Payload = Self::metadata_to_payload(metadata)?.into();

        self.client
            .overwrite_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload)
                    .points_selector(PointsIdsList {
                        ids: vec![self.point_id(user_id)],
                    })
                    .wait(true),
            )
            .await
            .map_err(|e| MatchingError::IndexWrite(e.to_string()))?;

        tracing::debug!(user_id, "Overwrote metadata payload");
        Ok(())
    }

    async fn ping(&self) -> MatchingResult<()> {
        self.client
            .health_check()
            .await
            .map(|_| ())
            .map_err(|e| MatchingError::IndexRead(e.to_string()))
    }
}
