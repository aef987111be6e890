use axum_helpers::{AuthMethod, SignatureAuthConfig};
use core_config::server::ServerConfig;
use core_config::{
    ConfigError, FromEnv, app_info, env_optional, env_or_default, env_parse_or_default,
    env_required,
};
use domain_matching::embedding::EmbeddingProviderConfig;
use domain_matching::qdrant_store::QdrantStoreConfig;
use domain_matching::service::PipelineConfig;

// Re-export Environment for use in other modules
pub use core_config::{AppInfo, Environment};

/// Trait snapshot storage location.
#[derive(Clone, Debug)]
pub struct TraitStorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub prefix: String,
}

impl FromEnv for TraitStorageConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: env_or_default("TRAIT_STORAGE_ENDPOINT", "https://storage.googleapis.com"),
            bucket: env_required("TRAIT_STORAGE_BUCKET")?,
            region: env_or_default("TRAIT_STORAGE_REGION", "us-central1"),
            prefix: env_or_default("TRAIT_STORAGE_PREFIX", "aggregated-traits"),
        })
    }
}

/// Inbound per-instance request rate limit.
#[derive(Clone, Debug)]
pub struct RequestRateLimitConfig {
    pub per_second: u64,
    pub burst: u32,
}

impl FromEnv for RequestRateLimitConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            per_second: env_parse_or_default("REQUEST_RATE_LIMIT_PER_SECOND", 10)?,
            burst: env_parse_or_default("REQUEST_RATE_LIMIT_BURST", 20)?,
        })
    }
}

/// Application-specific configuration.
/// Composes shared config components from the `config` library.
#[derive(Clone, Debug)]
pub struct Config {
    pub app: AppInfo,
    pub server: ServerConfig,
    pub environment: Environment,
    pub auth: SignatureAuthConfig,
    pub embedding: EmbeddingProviderConfig,
    /// Path to a service-account key file; when unset the ambient metadata
    /// server provides credentials.
    pub credentials_file: Option<String>,
    pub metadata_endpoint: String,
    pub index: QdrantStoreConfig,
    pub traits: TraitStorageConfig,
    pub rate_limit: RequestRateLimitConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        let environment = Environment::from_env();
        let server = ServerConfig::from_env()?; // Uses defaults: HOST=0.0.0.0, PORT=8080

        let auth_method: AuthMethod = env_or_default("AUTH_METHOD", "signed-secret").parse()?;
        let shared_secret = match auth_method {
            AuthMethod::SignedSecret => env_required("AUTH_SHARED_SECRET")?,
            AuthMethod::Mtls => env_optional("AUTH_SHARED_SECRET").unwrap_or_default(),
        };
        let auth = SignatureAuthConfig::new(
            auth_method,
            shared_secret,
            env_parse_or_default(
                "AUTH_TOKEN_EXPIRATION_SECS",
                SignatureAuthConfig::DEFAULT_MAX_CLOCK_SKEW_SECS,
            )?,
        )?;

        let embedding = EmbeddingProviderConfig {
            project: env_required("EMBEDDING_PROJECT")?,
            location: env_or_default("EMBEDDING_LOCATION", "us-central1"),
            model: env_or_default("EMBEDDING_MODEL", "text-embedding-005"),
            dimension: env_parse_or_default("EMBEDDING_DIMENSION", 768)?,
            requests_per_second: env_parse_or_default("EMBEDDING_REQUESTS_PER_SECOND", 5)?,
            max_concurrency: env_parse_or_default("EMBEDDING_MAX_CONCURRENCY", 4)?,
            endpoint: env_optional("EMBEDDING_ENDPOINT"),
        };

        let index = QdrantStoreConfig {
            url: env_required("VECTOR_INDEX_URL")?,
            api_key: env_optional("VECTOR_INDEX_API_KEY"),
            collection: env_or_default("VECTOR_INDEX_COLLECTION", "user-embeddings"),
            dimension: embedding.dimension,
            namespace: env_or_default("VECTOR_INDEX_NAMESPACE", "matching-pool"),
            timeout_secs: env_parse_or_default("VECTOR_INDEX_TIMEOUT_SECS", 10)?,
        };

        let pipeline = PipelineConfig {
            workers: env_parse_or_default("PIPELINE_WORKERS", 4)?,
            queue_capacity: env_parse_or_default("PIPELINE_QUEUE_CAPACITY", 64)?,
        };

        Ok(Self {
            app: app_info!(),
            server,
            environment,
            auth,
            embedding,
            credentials_file: env_optional("EMBEDDING_CREDENTIALS_FILE"),
            metadata_endpoint: env_or_default(
                "METADATA_SERVER_ENDPOINT",
                "http://metadata.google.internal",
            ),
            index,
            traits: TraitStorageConfig::from_env()?,
            rate_limit: RequestRateLimitConfig::from_env()?,
            pipeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_minimal_env<F: FnOnce()>(f: F) {
        temp_env::with_vars(
            [
                ("AUTH_SHARED_SECRET", Some("s3cret")),
                ("EMBEDDING_PROJECT", Some("proj")),
                ("VECTOR_INDEX_URL", Some("http://localhost:6334")),
                ("TRAIT_STORAGE_BUCKET", Some("traits")),
            ],
            f,
        );
    }

    #[test]
    fn minimal_env_loads_with_defaults() {
        with_minimal_env(|| {
            let config = Config::from_env().unwrap();
            assert_eq!(config.auth.method, AuthMethod::SignedSecret);
            assert_eq!(config.auth.max_clock_skew_secs, 300);
            assert_eq!(config.embedding.dimension, 768);
            assert_eq!(config.index.collection, "user-embeddings");
            assert_eq!(config.index.dimension, 768);
            assert_eq!(config.traits.prefix, "aggregated-traits");
            assert_eq!(config.rate_limit.per_second, 10);
            assert_eq!(config.pipeline.workers, 4);
        });
    }

    #[test]
    fn signed_secret_requires_the_shared_secret() {
        temp_env::with_vars(
            [
                ("AUTH_SHARED_SECRET", None::<&str>),
                ("EMBEDDING_PROJECT", Some("proj")),
                ("VECTOR_INDEX_URL", Some("http://localhost:6334")),
                ("TRAIT_STORAGE_BUCKET", Some("traits")),
            ],
            || {
                assert!(Config::from_env().is_err());
            },
        );
    }

    #[test]
    fn mtls_does_not_require_a_secret() {
        temp_env::with_vars(
            [
                ("AUTH_METHOD", Some("mtls")),
                ("AUTH_SHARED_SECRET", None::<&str>),
                ("EMBEDDING_PROJECT", Some("proj")),
                ("VECTOR_INDEX_URL", Some("http://localhost:6334")),
                ("TRAIT_STORAGE_BUCKET", Some("traits")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.auth.method, AuthMethod::Mtls);
            },
        );
    }

    #[test]
    fn unparseable_numeric_value_is_an_error() {
        temp_env::with_vars(
            [
                ("AUTH_SHARED_SECRET", Some("s3cret")),
                ("EMBEDDING_PROJECT", Some("proj")),
                ("VECTOR_INDEX_URL", Some("http://localhost:6334")),
                ("TRAIT_STORAGE_BUCKET", Some("traits")),
                ("EMBEDDING_DIMENSION", Some("lots")),
            ],
            || {
                assert!(Config::from_env().is_err());
            },
        );
    }

    #[test]
    fn index_dimension_follows_the_embedding_dimension() {
        temp_env::with_vars(
            [
                ("AUTH_SHARED_SECRET", Some("s3cret")),
                ("EMBEDDING_PROJECT", Some("proj")),
                ("VECTOR_INDEX_URL", Some("http://localhost:6334")),
                ("TRAIT_STORAGE_BUCKET", Some("traits")),
                ("EMBEDDING_DIMENSION", Some("512")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.index.dimension, 512);
            },
        );
    }
}
