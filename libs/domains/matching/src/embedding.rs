//! Client for the external embedding-generation API.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::json;
use std::sync::Arc;

use crate::auth_token::AccessTokenProvider;
use crate::error::{MatchingError, MatchingResult};
use crate::rate_limit::TokenBucket;

/// Seam for embedding generation. The production implementation calls the
/// remote predict endpoint; tests substitute counting fakes.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate a fixed-dimension embedding for one text.
    async fn generate(&self, text: &str) -> MatchingResult<Vec<f32>>;

    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Model identifier recorded alongside generated embeddings.
    fn model(&self) -> &str;

    /// Texts embedded concurrently within one batch chunk.
    fn max_concurrency(&self) -> usize {
        4
    }

    /// Embed a batch: chunks run sequentially, texts within a chunk run
    /// concurrently (each still individually rate-limited by the
    /// implementation), and output order matches input order.
    async fn generate_batch(&self, texts: &[String]) -> MatchingResult<Vec<Vec<f32>>> {
        let chunk_size = self.max_concurrency().max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(chunk_size) {
            let chunk_vectors = try_join_all(chunk.iter().map(|text| self.generate(text))).await?;
            vectors.extend(chunk_vectors);
        }

        Ok(vectors)
    }
}

/// Embedding provider settings.
#[derive(Clone, Debug)]
pub struct EmbeddingProviderConfig {
    pub project: String,
    pub location: String,
    pub model: String,
    pub dimension: usize,
    pub requests_per_second: u32,
    pub max_concurrency: usize,
    /// Override for the API base URL; defaults to the location-scoped
    /// platform endpoint.
    pub endpoint: Option<String>,
}

impl EmbeddingProviderConfig {
    fn predict_url(&self) -> String {
        let base = self.endpoint.clone().unwrap_or_else(|| {
            format!("https://{}-aiplatform.googleapis.com", self.location)
        });
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            base.trim_end_matches('/'),
            self.project,
            self.location,
            self.model
        )
    }
}

/// Rate-limited HTTP embedding client.
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    tokens: Arc<AccessTokenProvider>,
    bucket: TokenBucket,
    config: EmbeddingProviderConfig,
}

impl HttpEmbeddingClient {
    pub fn new(tokens: Arc<AccessTokenProvider>, config: EmbeddingProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            bucket: TokenBucket::per_second(config.requests_per_second),
            config,
        }
    }

    fn extract_vector(body: &serde_json::Value) -> Option<Vec<f32>> {
        let values = body
            .get("predictions")?
            .get(0)?
            .get("embeddings")?
            .get("values")?
            .as_array()?;

        let mut vector = Vec::with_capacity(values.len());
        for value in values {
            vector.push(value.as_f64()? as f32);
        }
        Some(vector)
    }
}

#[async_trait]
impl Embedder for HttpEmbeddingClient {
    async fn generate(&self, text: &str) -> MatchingResult<Vec<f32>> {
        self.bucket.wait_for_token(None).await?;

        let bearer = self.tokens.bearer_token().await?;
        let response = self
            .http
            .post(self.config.predict_url())
            .bearer_auth(bearer)
            .json(&json!({
                "instances": [{ "content": text }],
            }))
            .send()
            .await
            .map_err(|e| MatchingError::EmbeddingApi(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MatchingError::EmbeddingApi(format!("{}: {}", status, body)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MatchingError::EmbeddingApi(e.to_string()))?;

        let vector = Self::extract_vector(&body).ok_or(MatchingError::EmptyEmbedding)?;
        if vector.is_empty() {
            return Err(MatchingError::EmptyEmbedding);
        }

        tracing::debug!(dimension = vector.len(), "Generated embedding");
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }
}
