use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    components(schemas(
        axum_helpers::ErrorResponse,
        domain_matching::MatchMetadata,
        domain_matching::MatchMetadataPatch,
        domain_matching::MatchingStatus,
        domain_matching::SimilarUser,
        domain_matching::UserRecord,
        domain_matching::handlers::OptInRequest,
        domain_matching::handlers::OptInResponse,
        domain_matching::handlers::OptOutResponse,
        domain_matching::handlers::StatusResponse,
        domain_matching::handlers::MetadataUpdateResponse,
        domain_matching::handlers::SimilarUsersResponse,
        domain_matching::handlers::ActiveSeekersResponse,
        domain_matching::handlers::FetchByIdsRequest,
        domain_matching::handlers::FetchVectorsResponse,
    )),
    info(
        title = "Matching API",
        version = "0.1.0",
        description = "Embedding-based matching pool: opt-in pipeline, vector index queries, and matching metadata"
    ),
    tags(
        (name = "embedding", description = "Opt-in lifecycle and embedding pipeline"),
        (name = "index", description = "Vector index queries and metadata updates")
    )
)]
pub struct ApiDoc;
