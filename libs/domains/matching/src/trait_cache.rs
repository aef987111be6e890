//! Trait aggregation cache.
//!
//! Trait extraction itself is an external collaborator returning a list of
//! short strings per user; this module only owns the caching contract:
//! cache-or-fresh with a 24h TTL, entries expire by age and are never
//! explicitly deleted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::auth_token::AccessTokenProvider;
use crate::error::{MatchingError, MatchingResult};
use crate::models::UserTraits;
use crate::now_millis;

/// Default snapshot time-to-live.
pub const TRAIT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// External trait aggregator seam.
#[async_trait]
pub trait TraitSource: Send + Sync {
    /// Fetch the current trait list for a user.
    async fn fetch_traits(&self, user_id: &str) -> MatchingResult<Vec<String>>;

    /// Tag recorded on cached snapshots.
    fn source_name(&self) -> &str {
        "aggregator"
    }
}

/// Trait source backed by aggregated snapshots in object storage:
/// `GET {endpoint}/{bucket}/{prefix}/{user_id}.json`, a JSON array of
/// short trait strings.
pub struct ObjectStorageTraitSource {
    http: reqwest::Client,
    tokens: Arc<AccessTokenProvider>,
    endpoint: String,
    bucket: String,
    prefix: String,
}

impl ObjectStorageTraitSource {
    pub fn new(
        tokens: Arc<AccessTokenProvider>,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn object_url(&self, user_id: &str) -> String {
        format!(
            "{}/{}/{}/{}.json",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            self.prefix.trim_matches('/'),
            user_id
        )
    }
}

#[async_trait]
impl TraitSource for ObjectStorageTraitSource {
    async fn fetch_traits(&self, user_id: &str) -> MatchingResult<Vec<String>> {
        let bearer = self.tokens.bearer_token().await?;

        let response = self
            .http
            .get(self.object_url(user_id))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| MatchingError::TraitSource(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MatchingError::TraitSource(format!(
                "trait snapshot fetch for {} returned {}",
                user_id,
                response.status()
            )));
        }

        let traits: Vec<String> = response
            .json()
            .await
            .map_err(|e| MatchingError::TraitSource(format!("malformed trait snapshot: {}", e)))?;

        Ok(traits)
    }

    fn source_name(&self) -> &str {
        "object-storage"
    }
}

/// TTL cache in front of a [`TraitSource`].
pub struct TraitCache<S: TraitSource> {
    source: Arc<S>,
    ttl: Duration,
    entries: RwLock<HashMap<String, UserTraits>>,
}

impl<S: TraitSource> TraitCache<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self::with_ttl(source, TRAIT_CACHE_TTL)
    }

    pub fn with_ttl(source: Arc<S>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Serve the cached snapshot unless it is stale or `force_refresh` is
    /// set; otherwise fetch, stamp, and store a fresh one.
    pub async fn get(&self, user_id: &str, force_refresh: bool) -> MatchingResult<UserTraits> {
        if !force_refresh {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(user_id)
                && !cached.is_stale(self.ttl)
            {
                tracing::debug!(user_id, "Trait cache hit");
                return Ok(cached.clone());
            }
        }

        tracing::debug!(user_id, force_refresh, "Trait cache miss, fetching");
        let traits = self.source.fetch_traits(user_id).await?;

        let now = now_millis();
        let mut entries = self.entries.write().await;
        let snapshot = UserTraits {
            user_id: user_id.to_string(),
            traits,
            source: self.source.source_name().to_string(),
            created_at: entries.get(user_id).map_or(now, |e| e.created_at),
            updated_at: now,
        };
        entries.insert(user_id.to_string(), snapshot.clone());

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        fetches: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TraitSource for CountingSource {
        async fn fetch_traits(&self, _user_id: &str) -> MatchingResult<Vec<String>> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![format!("trait-{}", n)])
        }
    }

    #[tokio::test]
    async fn cache_hit_avoids_a_second_fetch() {
        let source = CountingSource::new();
        let cache = TraitCache::new(source.clone());

        let first = cache.get("u1", false).await.unwrap();
        let second = cache.get("u1", false).await.unwrap();

        assert_eq!(first.traits, second.traits);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_the_cache() {
        let source = CountingSource::new();
        let cache = TraitCache::new(source.clone());

        cache.get("u1", false).await.unwrap();
        let refreshed = cache.get("u1", true).await.unwrap();

        assert_eq!(refreshed.traits, vec!["trait-1".to_string()]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_entries_are_refetched() {
        let source = CountingSource::new();
        let cache = TraitCache::with_ttl(source.clone(), Duration::from_millis(1));

        cache.get("u1", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.get("u1", false).await.unwrap();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_users_have_distinct_entries() {
        let source = CountingSource::new();
        let cache = TraitCache::new(source.clone());

        cache.get("u1", false).await.unwrap();
        cache.get("u2", false).await.unwrap();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn object_url_shape() {
        let tokens = Arc::new(AccessTokenProvider::from_metadata_server("http://metadata"));
        let source = ObjectStorageTraitSource::new(
            tokens,
            "https://storage.example.com/",
            "traits-bucket",
            "/aggregated/",
        );
        assert_eq!(
            source.object_url("u1"),
            "https://storage.example.com/traits-bucket/aggregated/u1.json"
        );
    }
}
