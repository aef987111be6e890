//! Structured error responses shared by every API surface.

mod handlers;

pub use handlers::{method_not_allowed, not_found};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// JSON body returned for every error response.
///
/// `error` is a stable machine-readable label (e.g. `"validation_error"`),
/// `message` is human-readable, `details` optionally carries structured
/// context.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}
