//! Vector index client: the repository seam plus the merge/normalization
//! semantics layered on top of it.
//!
//! [`VectorIndexStore`] is the transport-level trait (qdrant in production,
//! [`InMemoryIndexStore`] in tests); [`IndexClient`] owns what the domain
//! actually guarantees: metadata normalization on every read, the
//! fetch-merge-rewrite metadata update, empty-batch short circuits, and the
//! zero-vector scan substitute for listing active seekers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::error::{MatchingError, MatchingResult};
use crate::models::{MatchMetadata, MatchMetadataPatch, SimilarUser, UserEmbedding, UserRecord};
use crate::now_millis;

/// Upper bound used when scanning for all active seekers; the underlying
/// store has no native full-scan primitive.
pub const ACTIVE_SEEKERS_SCAN_LIMIT: u64 = 10_000;

/// A stored record: vector plus normalized metadata.
#[derive(Debug, Clone)]
pub struct UserPoint {
    pub user_id: String,
    pub vector: Option<Vec<f32>>,
    pub metadata: MatchMetadata,
}

/// One similarity-search hit.
#[derive(Debug, Clone)]
pub struct ScoredUserPoint {
    pub point: UserPoint,
    pub score: f32,
}

/// Transport seam to the external vector index.
#[async_trait]
pub trait VectorIndexStore: Send + Sync {
    /// Write vector and full metadata payload, replacing any existing record.
    async fn upsert(&self, point: UserPoint) -> MatchingResult<()>;

    /// Direct key lookup; missing ids are simply absent from the result.
    async fn fetch(&self, ids: &[String], include_vectors: bool) -> MatchingResult<Vec<UserPoint>>;

    /// Nearest-neighbor search, optionally filtered to active seekers.
    /// Metadata is always populated; vectors only when requested.
    async fn search(
        &self,
        vector: Vec<f32>,
        top_k: u64,
        seeking_only: bool,
        include_vectors: bool,
    ) -> MatchingResult<Vec<ScoredUserPoint>>;

    /// Replace the record's entire metadata payload. The caller always
    /// sends the full merged object, never a sparse patch.
    async fn overwrite_metadata(
        &self,
        user_id: &str,
        metadata: &MatchMetadata,
    ) -> MatchingResult<()>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> MatchingResult<()>;
}

/// Domain-facing client over a [`VectorIndexStore`].
pub struct IndexClient<S: VectorIndexStore> {
    store: Arc<S>,
    dimension: usize,
}

impl<S: VectorIndexStore> IndexClient<S> {
    pub fn new(store: Arc<S>, dimension: usize) -> Self {
        Self { store, dimension }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist a freshly generated embedding with its full metadata.
    pub async fn upsert_embedding(
        &self,
        embedding: &UserEmbedding,
        mut metadata: MatchMetadata,
    ) -> MatchingResult<()> {
        metadata.user_id = embedding.user_id.clone();
        metadata.updated_at = now_millis();

        self.store
            .upsert(UserPoint {
                user_id: embedding.user_id.clone(),
                vector: Some(embedding.vector.clone()),
                metadata,
            })
            .await
    }

    /// Fetch-merge-rewrite metadata update.
    ///
    /// Reads the current record (absent user is [`MatchingError::UserNotFound`]),
    /// overlays the patch on the normalized copy, forces the user id and
    /// `updated_at`, then writes the entire merged object back. Because the
    /// write is the full local view, any payload field this model does not
    /// represent is reset to its default on every update.
    pub async fn update_metadata(
        &self,
        user_id: &str,
        patch: &MatchMetadataPatch,
    ) -> MatchingResult<MatchMetadata> {
        let current = self
            .fetch_by_id(user_id, false)
            .await?
            .ok_or_else(|| MatchingError::UserNotFound(user_id.to_string()))?;

        let mut merged = current.metadata;
        merged.apply_patch(patch, user_id);

        self.store.overwrite_metadata(user_id, &merged).await?;
        Ok(merged)
    }

    /// Similarity search; an empty result is a normal outcome, not an error.
    pub async fn query(
        &self,
        vector: Vec<f32>,
        top_k: u64,
        seeking_only: bool,
        include_vectors: bool,
    ) -> MatchingResult<Vec<SimilarUser>> {
        let hits = self
            .store
            .search(vector, top_k, seeking_only, include_vectors)
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| SimilarUser {
                user_id: hit.point.user_id,
                score: hit.score,
                metadata: hit.point.metadata,
                vector: hit.point.vector,
            })
            .collect())
    }

    pub async fn fetch_by_id(
        &self,
        user_id: &str,
        include_vectors: bool,
    ) -> MatchingResult<Option<UserPoint>> {
        let mut points = self
            .store
            .fetch(&[user_id.to_string()], include_vectors)
            .await?;
        Ok(points.pop())
    }

    /// Batch key lookup; an empty id list short-circuits without touching
    /// the remote store.
    pub async fn fetch_by_ids(
        &self,
        ids: &[String],
        include_vectors: bool,
    ) -> MatchingResult<Vec<UserRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let points = self.store.fetch(ids, include_vectors).await?;
        Ok(points
            .into_iter()
            .map(|point| UserRecord {
                user_id: point.user_id,
                metadata: point.metadata,
                vector: point.vector,
            })
            .collect())
    }

    /// All ids currently seeking a match.
    ///
    /// Scan substitute: a zero-vector similarity query with the seeking
    /// filter and a very large limit. The scores from this query are
    /// meaningless and are deliberately not exposed.
    pub async fn fetch_active_seeker_ids(&self) -> MatchingResult<Vec<String>> {
        let zero = vec![0.0; self.dimension];
        let hits = self
            .store
            .search(zero, ACTIVE_SEEKERS_SCAN_LIMIT, true, false)
            .await?;

        Ok(hits.into_iter().map(|hit| hit.point.user_id).collect())
    }

    pub async fn ping(&self) -> MatchingResult<()> {
        self.store.ping().await
    }
}

/// In-memory store for tests and local development.
///
/// Payloads are kept as raw JSON so reads exercise the same normalization
/// path the production store uses, and so overwrite semantics (dropping
/// unknown payload fields) can be regression-tested.
#[derive(Default)]
pub struct InMemoryIndexStore {
    records: RwLock<HashMap<String, (Option<Vec<f32>>, Value)>>,
    pub upsert_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl InMemoryIndexStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a record with an arbitrary raw payload (may contain unknown or
    /// mistyped fields, as an external writer could produce).
    pub async fn seed_raw(&self, user_id: &str, vector: Option<Vec<f32>>, payload: Value) {
        let mut records = self.records.write().await;
        records.insert(user_id.to_string(), (vector, payload));
    }

    pub async fn raw_payload(&self, user_id: &str) -> Option<Value> {
        let records = self.records.read().await;
        records.get(user_id).map(|(_, payload)| payload.clone())
    }

    fn decode(user_id: &str, vector: Option<Vec<f32>>, payload: &Value) -> UserPoint {
        let empty = serde_json::Map::new();
        let map = payload.as_object().unwrap_or(&empty);
        UserPoint {
            user_id: user_id.to_string(),
            vector,
            metadata: MatchMetadata::from_untrusted(user_id, map),
        }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl VectorIndexStore for InMemoryIndexStore {
    async fn upsert(&self, point: UserPoint) -> MatchingResult<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::to_value(&point.metadata)
            .map_err(|e| MatchingError::IndexWrite(e.to_string()))?;

        let mut records = self.records.write().await;
        records.insert(point.user_id.clone(), (point.vector, payload));
        Ok(())
    }

    async fn fetch(&self, ids: &[String], include_vectors: bool) -> MatchingResult<Vec<UserPoint>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.read().await;

        Ok(ids
            .iter()
            .filter_map(|id| {
                records.get(id).map(|(vector, payload)| {
                    let vector = include_vectors.then(|| vector.clone()).flatten();
                    Self::decode(id, vector, payload)
                })
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
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.read().await;

        let mut hits: Vec<ScoredUserPoint> = records
            .iter()
            .filter_map(|(id, (stored_vector, payload))| {
                let stored = stored_vector.as_ref()?;
                let point = Self::decode(
                    id,
                    include_vectors.then(|| stored.clone()),
                    payload,
                );
                if seeking_only && !point.metadata.seeking_match {
                    return None;
                }
                Some(ScoredUserPoint {
                    score: Self::cosine(&vector, stored),
                    point,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k as usize);
        Ok(hits)
    }

    async fn overwrite_metadata(
        &self,
        user_id: &str,
        metadata: &MatchMetadata,
    ) -> MatchingResult<()> {
        let payload = serde_json::to_value(metadata)
            .map_err(|e| MatchingError::IndexWrite(e.to_string()))?;

        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(user_id) else {
            return Err(MatchingError::IndexWrite(format!(
                "no record for {}",
                user_id
            )));
        };
        record.1 = payload;
        Ok(())
    }

    async fn ping(&self) -> MatchingResult<()> {
        Ok(())
    }
}
