use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use axum_helpers::signature_auth_middleware;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor,
};

pub mod health;

use crate::state::AppState;

/// Composes the authenticated API surface.
///
/// Both route groups sit behind the signature auth middleware and a global
/// per-instance request rate limit. Health endpoints are mounted separately
/// so probes never need credentials.
pub fn routes(state: &AppState) -> eyre::Result<Router> {
    let auth = Arc::new(state.config.auth.clone());

    // Global (not per-client) limiter: the callers are a handful of trusted
    // services, so one shared budget matches how the quota is granted.
    let governor = GovernorConfigBuilder::default()
        .per_second(state.config.rate_limit.per_second)
        .burst_size(state.config.rate_limit.burst)
        .key_extractor(GlobalKeyExtractor)
        .finish()
        .ok_or_else(|| eyre::eyre!("invalid request rate limit configuration"))?;

    let router = Router::new()
        .nest(
            "/embedding",
            domain_matching::handlers::embedding_router(state.service.clone()),
        )
        .nest(
            "/index",
            domain_matching::handlers::index_router(state.service.clone()),
        )
        .layer(middleware::from_fn_with_state(auth, signature_auth_middleware))
        .layer(GovernorLayer::new(governor));

    Ok(router)
}

/// Readiness routes, outside the auth layer.
pub fn ready_router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready_handler))
        .with_state(state)
}
