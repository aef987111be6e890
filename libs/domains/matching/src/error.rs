use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_helpers::ErrorResponse;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchingError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Vector index write failed: {0}")]
    IndexWrite(String),

    #[error("Vector index read failed: {0}")]
    IndexRead(String),

    #[error("Embedding API error: {0}")]
    EmbeddingApi(String),

    #[error("Embedding API returned no embedding")]
    EmptyEmbedding,

    #[error("Trait source error: {0}")]
    TraitSource(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Rate limit wait would exceed the caller timeout")]
    RateLimitTimeout,

    #[error("Rate limiter yielded no token after waiting")]
    RateLimitExhausted,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type MatchingResult<T> = Result<T, MatchingError>;

impl IntoResponse for MatchingError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            MatchingError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            MatchingError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone())
            }
            MatchingError::UserNotFound(user_id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("User {} not found", user_id),
            ),
            MatchingError::IndexWrite(msg) | MatchingError::IndexRead(msg) => {
                tracing::error!("Vector index error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    format!("Vector index error: {}", msg),
                )
            }
            MatchingError::EmbeddingApi(msg) => {
                tracing::error!("Embedding API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    format!("Embedding API error: {}", msg),
                )
            }
            MatchingError::EmptyEmbedding => {
                tracing::error!("Embedding API returned no embedding");
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "Embedding API returned no embedding".to_string(),
                )
            }
            MatchingError::TraitSource(msg) => {
                tracing::error!("Trait source error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    format!("Trait source error: {}", msg),
                )
            }
            MatchingError::Credential(msg)
            | MatchingError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            MatchingError::RateLimitTimeout | MatchingError::RateLimitExhausted => {
                // Background-path errors; reaching a handler means a bug,
                // so surface as a generic 500.
                tracing::error!("Rate limiter error surfaced to a handler: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse::new(error_type, message)),
        )
            .into_response()
    }
}
