//! Application-specific readiness checks.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use axum_helpers::server::{HealthCheckFuture, run_health_checks};

use crate::state::AppState;

/// Readiness endpoint that probes the vector index.
///
/// The embedding provider and trait storage are deliberately not probed:
/// both are pay-per-call external APIs and their failures surface through
/// the job ledger rather than through readiness.
pub async fn ready_handler(State(state): State<AppState>) -> Response {
    let checks: Vec<(&str, HealthCheckFuture<'_>)> = vec![(
        "vector_index",
        Box::pin(async {
            state
                .service
                .ping_index()
                .await
                .map_err(|e| format!("vector index ping failed: {}", e))
        }),
    )];

    match run_health_checks(checks).await {
        Ok((status, json)) => (status, json).into_response(),
        Err((status, json)) => (status, json).into_response(),
    }
}
