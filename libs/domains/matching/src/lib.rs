//! Matching pool domain: the embedding/matching pipeline.
//!
//! Users opt into a similarity-matching pool. Their behavioral traits are
//! embedded into a fixed-dimension vector, stored in an external vector
//! index alongside matching metadata, and later queried for behaviorally
//! similar pool members.
//!
//! Layering follows the repository/service/handlers convention:
//! - [`index`] owns the vector-index seam ([`index::VectorIndexStore`]) and
//!   the metadata merge/normalization semantics ([`index::IndexClient`]);
//! - [`embedding`] and [`trait_cache`] are the outbound collaborators;
//! - [`service`] is the opt-in orchestrator wiring them together behind a
//!   bounded background pipeline;
//! - [`handlers`] is the HTTP surface.

pub mod auth_token;
pub mod embedding;
pub mod error;
pub mod handlers;
pub mod index;
pub mod models;
pub mod qdrant_store;
pub mod rate_limit;
pub mod service;
pub mod trait_cache;

pub use error::{MatchingError, MatchingResult};
pub use models::{
    MatchMetadata, MatchMetadataPatch, MatchingStatus, OptInStatus, SimilarUser, UserEmbedding,
    UserRecord, UserTraits,
};
pub use service::{MatchingService, PipelineConfig};

/// Current unix time in milliseconds; the wire format for every timestamp
/// except the auth header (which is unix seconds).
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
