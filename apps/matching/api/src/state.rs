use std::sync::Arc;

use domain_matching::embedding::HttpEmbeddingClient;
use domain_matching::qdrant_store::QdrantIndexStore;
use domain_matching::service::MatchingService;
use domain_matching::trait_cache::ObjectStorageTraitSource;

use crate::config::Config;

/// Concrete service wiring for this binary: qdrant index, HTTP embedding
/// provider, object-storage trait source.
pub type Service = MatchingService<QdrantIndexStore, HttpEmbeddingClient, ObjectStorageTraitSource>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<Service>,
}
