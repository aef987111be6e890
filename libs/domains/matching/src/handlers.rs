//! HTTP surface for the matching domain.
//!
//! Two routers sharing one service: [`embedding_router`] carries the opt-in
//! lifecycle, [`index_router`] the vector-index operations. Both are mounted
//! behind the gateway's signature auth by the binary crate.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::embedding::Embedder;
use crate::error::{MatchingError, MatchingResult};
use crate::index::VectorIndexStore;
use crate::models::{MatchMetadataPatch, MatchingStatus, SimilarUser, UserRecord};
use crate::now_millis;
use crate::service::MatchingService;
use crate::trait_cache::TraitSource;

const DEFAULT_TOP_K: u64 = 10;

type Service<S, E, T> = Arc<MatchingService<S, E, T>>;

/// Opt-in lifecycle endpoints.
pub fn embedding_router<S, E, T>(service: Service<S, E, T>) -> Router
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    Router::new()
        .route("/user/{user_id}/opt-in", post(opt_in::<S, E, T>))
        .route("/user/{user_id}/opt-out", post(opt_out::<S, E, T>))
        .route("/user/{user_id}/status", get(status::<S, E, T>))
        .with_state(service)
}

/// Vector-index endpoints.
pub fn index_router<S, E, T>(service: Service<S, E, T>) -> Router
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    Router::new()
        .route("/user/{user_id}/metadata", put(update_metadata::<S, E, T>))
        .route("/user/{user_id}/similar", get(find_similar::<S, E, T>))
        .route("/active-seekers-ids", get(active_seekers::<S, E, T>))
        .route("/fetch-vectors-by-ids", post(fetch_by_ids::<S, E, T>))
        .with_state(service)
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptInRequest {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptInResponse {
    pub user_id: String,
    pub status: String,
    pub message: String,
    pub timestamp: i64,
}

/// POST /user/:user_id/opt-in
async fn opt_in<S, E, T>(
    State(service): State<Service<S, E, T>>,
    Path(user_id): Path<String>,
    body: Option<Json<OptInRequest>>,
) -> MatchingResult<Json<OptInResponse>>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    let Json(request) = body.unwrap_or_default();
    let outcome = service.opt_in(&user_id, request.force_refresh).await?;

    Ok(Json(OptInResponse {
        user_id,
        status: outcome.status.to_string(),
        message: outcome.message,
        timestamp: now_millis(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptOutResponse {
    pub user_id: String,
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

/// POST /user/:user_id/opt-out
async fn opt_out<S, E, T>(
    State(service): State<Service<S, E, T>>,
    Path(user_id): Path<String>,
) -> MatchingResult<Json<OptOutResponse>>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    service.opt_out(&user_id).await?;

    Ok(Json(OptOutResponse {
        user_id,
        success: true,
        message: "opted out of matching".to_string(),
        timestamp: now_millis(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub user_id: String,
    pub matching_status: MatchingStatus,
    pub timestamp: i64,
}

/// GET /user/:user_id/status
async fn status<S, E, T>(
    State(service): State<Service<S, E, T>>,
    Path(user_id): Path<String>,
) -> MatchingResult<Json<StatusResponse>>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    let matching_status = service.status(&user_id).await?;

    Ok(Json(StatusResponse {
        user_id,
        matching_status,
        timestamp: now_millis(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdateResponse {
    pub user_id: String,
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

/// PUT /user/:user_id/metadata
///
/// Accepts raw JSON so a non-object body can be rejected explicitly;
/// unrecognized fields deserialize to an empty patch, which the service
/// rejects.
async fn update_metadata<S, E, T>(
    State(service): State<Service<S, E, T>>,
    Path(user_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> MatchingResult<Json<MetadataUpdateResponse>>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    let Some(map) = body.as_object() else {
        return Err(MatchingError::Validation(
            "metadata update body must be a JSON object".to_string(),
        ));
    };
    if map.is_empty() {
        return Err(MatchingError::Validation(
            "metadata update body is empty".to_string(),
        ));
    }

    let patch: MatchMetadataPatch = serde_json::from_value(body)
        .map_err(|e| MatchingError::Validation(format!("malformed metadata patch: {}", e)))?;
    service.update_metadata(&user_id, &patch).await?;

    Ok(Json(MetadataUpdateResponse {
        user_id,
        success: true,
        message: "metadata updated".to_string(),
        timestamp: now_millis(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarQuery {
    #[serde(default = "default_top_k")]
    pub top_k: u64,
    #[serde(default)]
    pub include_vectors: bool,
}

fn default_top_k() -> u64 {
    DEFAULT_TOP_K
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SimilarUsersResponse {
    pub user_id: String,
    pub similar_users: Vec<SimilarUser>,
    pub count: usize,
    pub timestamp: i64,
}

/// GET /user/:user_id/similar?topK=10&includeVectors=false
async fn find_similar<S, E, T>(
    State(service): State<Service<S, E, T>>,
    Path(user_id): Path<String>,
    Query(query): Query<SimilarQuery>,
) -> MatchingResult<Json<SimilarUsersResponse>>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    let similar_users = service
        .find_similar(&user_id, query.top_k, query.include_vectors)
        .await?;

    Ok(Json(SimilarUsersResponse {
        user_id,
        count: similar_users.len(),
        similar_users,
        timestamp: now_millis(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSeekersResponse {
    pub active_seekers_ids: Vec<String>,
    pub count: usize,
    pub timestamp: i64,
}

/// GET /active-seekers-ids
async fn active_seekers<S, E, T>(
    State(service): State<Service<S, E, T>>,
) -> MatchingResult<Json<ActiveSeekersResponse>>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    let active_seekers_ids = service.active_seeker_ids().await?;

    Ok(Json(ActiveSeekersResponse {
        count: active_seekers_ids.len(),
        active_seekers_ids,
        timestamp: now_millis(),
    }))
}

/// Documented shape of the fetch-vectors-by-ids body; the handler parses
/// raw JSON to control the error status for malformed bodies.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
pub struct FetchByIdsRequest {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchByIdsQuery {
    #[serde(default)]
    pub include_vectors: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchVectorsResponse {
    pub users: Vec<UserRecord>,
    pub count: usize,
    pub timestamp: i64,
}

/// POST /fetch-vectors-by-ids?includeVectors=false
///
/// Body is validated by hand so a missing or mistyped `userIds` is a 400
/// rather than a generic deserialization rejection.
async fn fetch_by_ids<S, E, T>(
    State(service): State<Service<S, E, T>>,
    Query(query): Query<FetchByIdsQuery>,
    Json(body): Json<serde_json::Value>,
) -> MatchingResult<Json<FetchVectorsResponse>>
where
    S: VectorIndexStore + 'static,
    E: Embedder + 'static,
    T: TraitSource + 'static,
{
    let user_ids: Vec<String> = body
        .get("userIds")
        .and_then(serde_json::Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .ok_or_else(|| MatchingError::Validation("userIds must be an array".to_string()))?;

    if user_ids.is_empty() {
        return Err(MatchingError::Validation(
            "userIds must be a non-empty list".to_string(),
        ));
    }

    let users = service
        .fetch_users(&user_ids, query.include_vectors)
        .await?;

    Ok(Json(FetchVectorsResponse {
        count: users.len(),
        users,
        timestamp: now_millis(),
    }))
}
