//! # Axum Helpers
//!
//! A collection of utilities, middleware, and helpers for building Axum web applications.
//!
//! ## Modules
//!
//! - **[`auth`]**: Signed-secret (HMAC) request authentication with replay window
//! - **[`server`]**: Server setup, health checks, graceful shutdown
//! - **[`errors`]**: Structured error responses

// Domain modules
pub mod auth;
pub mod errors;
pub mod server;

// Re-export auth types
pub use auth::{
    AuthMethod, SignatureAuthConfig, canonical_message, sign_message, signature_auth_middleware,
    verify_signature,
};

// Re-export server types
pub use server::{
    HealthCheckFuture, HealthResponse, create_app, create_router, health_router,
    run_health_checks, shutdown_signal,
};

// Re-export error types
pub use errors::ErrorResponse;
