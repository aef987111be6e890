//! Bearer-token acquisition for the embedding provider and trait storage.
//!
//! Two strategies, selected by environment: minting a token from an explicit
//! service-account credential file, or fetching one from the ambient platform
//! metadata endpoint. Either way the result is a short-lived bearer token
//! cached until shortly before expiry.

use serde::Deserialize;
use std::path::Path;
use tokio::sync::Mutex;

use crate::error::{MatchingError, MatchingResult};

const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this many seconds before the token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Parsed service-account key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        chrono::Utc::now().timestamp() < self.expires_at - EXPIRY_MARGIN_SECS
    }
}

#[derive(serde::Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

enum TokenStrategy {
    /// Mint a token by signing a JWT assertion with the credential-file key
    /// and exchanging it at the key's token endpoint.
    CredentialFile(Box<ServiceAccountKey>),
    /// Fetch from the platform metadata endpoint (ambient identity).
    MetadataServer { endpoint: String },
}

/// Caching provider of upstream bearer tokens.
pub struct AccessTokenProvider {
    strategy: TokenStrategy,
    http: reqwest::Client,
    cached: Mutex<Option<AccessToken>>,
}

impl AccessTokenProvider {
    /// Explicit credential-file strategy. Reads and parses the key eagerly
    /// so a missing or malformed file fails at startup, not per request.
    pub fn from_credential_file(path: impl AsRef<Path>) -> MatchingResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MatchingError::Credential(format!(
                "cannot read credential file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
            MatchingError::Credential(format!("malformed credential file: {}", e))
        })?;

        Ok(Self {
            strategy: TokenStrategy::CredentialFile(Box::new(key)),
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        })
    }

    /// Ambient metadata-server strategy.
    pub fn from_metadata_server(endpoint: impl Into<String>) -> Self {
        Self {
            strategy: TokenStrategy::MetadataServer {
                endpoint: endpoint.into(),
            },
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// A bearer token valid for at least [`EXPIRY_MARGIN_SECS`] more seconds.
    pub async fn bearer_token(&self) -> MatchingResult<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.token.clone());
        }

        let fresh = match &self.strategy {
            TokenStrategy::CredentialFile(key) => self.mint_from_key(key).await?,
            TokenStrategy::MetadataServer { endpoint } => self.fetch_from_metadata(endpoint).await?,
        };

        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn mint_from_key(&self, key: &ServiceAccountKey) -> MatchingResult<AccessToken> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: TOKEN_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let encoding_key =
            jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
                MatchingError::Credential(format!("invalid private key in credential file: {}", e))
            })?;
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let assertion = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| MatchingError::Credential(format!("failed to sign assertion: {}", e)))?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await
            .map_err(|e| MatchingError::Credential(format!("token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MatchingError::Credential(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            MatchingError::Credential(format!("malformed token response: {}", e))
        })?;

        Ok(AccessToken {
            token: parsed.access_token,
            expires_at: now + parsed.expires_in,
        })
    }

    async fn fetch_from_metadata(&self, endpoint: &str) -> MatchingResult<AccessToken> {
        let now = chrono::Utc::now().timestamp();
        let url = format!("{}{}", endpoint.trim_end_matches('/'), METADATA_TOKEN_PATH);

        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| MatchingError::Credential(format!("metadata token fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(MatchingError::Credential(format!(
                "metadata endpoint returned {}",
                response.status()
            )));
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            MatchingError::Credential(format!("malformed metadata token response: {}", e))
        })?;

        Ok(AccessToken {
            token: parsed.access_token,
            expires_at: now + parsed.expires_in,
        })
    }
}
