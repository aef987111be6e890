use std::sync::Arc;

use axum_helpers::server::{create_app, health_router};
use core_config::tracing::{init_tracing, install_color_eyre};
use domain_matching::auth_token::AccessTokenProvider;
use domain_matching::embedding::HttpEmbeddingClient;
use domain_matching::index::IndexClient;
use domain_matching::qdrant_store::QdrantIndexStore;
use domain_matching::service::MatchingService;
use domain_matching::trait_cache::{ObjectStorageTraitSource, TraitCache};
use tracing::info;

mod api;
mod config;
mod openapi;
mod state;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Install color-eyre first for colored error output (before any fallible operations)
    install_color_eyre();

    // Load configuration from environment variables
    let config = Config::from_env()?;

    // Initialize tracing with ErrorLayer for span trace capture
    init_tracing(&config.environment);

    // Upstream credentials: explicit key file when configured, otherwise the
    // ambient metadata server. A bad key file is fatal here, at startup.
    let tokens = match &config.credentials_file {
        Some(path) => {
            info!("Using service-account credentials from {}", path);
            Arc::new(AccessTokenProvider::from_credential_file(path)?)
        }
        None => {
            info!("Using ambient metadata-server credentials");
            Arc::new(AccessTokenProvider::from_metadata_server(
                &config.metadata_endpoint,
            ))
        }
    };

    info!("Connecting to vector index at {}", config.index.url);
    let store = Arc::new(QdrantIndexStore::new(config.index.clone())?);
    store.ensure_collection().await?;

    let embedder = Arc::new(HttpEmbeddingClient::new(
        tokens.clone(),
        config.embedding.clone(),
    ));

    let trait_source = Arc::new(ObjectStorageTraitSource::new(
        tokens,
        &config.traits.endpoint,
        &config.traits.bucket,
        &config.traits.prefix,
    ));
    let trait_cache = Arc::new(TraitCache::new(trait_source));

    let service = MatchingService::start(
        IndexClient::new(store, config.embedding.dimension),
        embedder,
        trait_cache,
        config.pipeline.clone(),
    );
    info!(
        workers = config.pipeline.workers,
        queue_capacity = config.pipeline.queue_capacity,
        "Opt-in pipeline workers started"
    );

    let state = AppState {
        config: Arc::new(config),
        service,
    };

    // Authenticated API routes, then docs/middleware from create_router
    let api_routes = api::routes(&state)?;
    let router = axum_helpers::create_router::<openapi::ApiDoc>(api_routes);

    // Health endpoints stay outside the auth middleware:
    // - /health: liveness with app name/version
    // - /health/ready: probes the vector index
    let app = router
        .merge(health_router(state.config.app))
        .merge(api::ready_router(state.clone()));

    info!("Starting matching API");
    create_app(app, &state.config.server)
        .await
        .map_err(|e| eyre::eyre!("Server error: {}", e))?;

    info!("Matching API shutdown complete");
    Ok(())
}
