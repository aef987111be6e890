use super::config::{AuthMethod, SignatureAuthConfig};
use super::signature::{canonical_message, verify_signature};
use super::{CLIENT_CERT_HEADER, HMAC_SCHEME, TIMESTAMP_HEADER};
use crate::errors::ErrorResponse;
use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Largest request body the middleware will buffer for signing.
const MAX_SIGNED_BODY_BYTES: usize = 2 * 1024 * 1024;

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("unauthorized", message)),
    )
        .into_response()
}

/// Extract the hex signature from `Authorization: HMAC <hex>`.
fn extract_signature(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix(HMAC_SCHEME).map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
}

fn extract_timestamp(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

/// Request authentication middleware.
///
/// Signed-secret mode validates, in order: the timestamp header is present;
/// the timestamp is within the configured clock-skew window ("timestamp
/// expired" otherwise — this is the only replay protection); the
/// `Authorization: HMAC <hex>` header is present; the signature matches the
/// canonical message `METHOD + PATH + TIMESTAMP [+ body]`.
///
/// mTLS mode only checks that the ingress forwarded a client certificate
/// header; certificate validation itself is transport infrastructure.
///
/// The body is buffered to compute the signature and reattached unchanged.
pub async fn signature_auth_middleware(
    State(config): State<Arc<SignatureAuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if config.method == AuthMethod::Mtls {
        if request.headers().get(CLIENT_CERT_HEADER).is_none() {
            tracing::debug!("Rejected request without forwarded client certificate");
            return unauthorized("Client certificate required");
        }
        return next.run(request).await;
    }

    let Some(timestamp) = extract_timestamp(request.headers()) else {
        tracing::debug!("Rejected request without a valid {} header", TIMESTAMP_HEADER);
        return unauthorized("Missing request timestamp");
    };

    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > config.max_clock_skew_secs {
        tracing::debug!(
            timestamp,
            now,
            skew = config.max_clock_skew_secs,
            "Rejected request with expired timestamp"
        );
        return unauthorized("Request timestamp expired");
    }

    let Some(signature) = extract_signature(request.headers()) else {
        tracing::debug!("Rejected request without an HMAC authorization header");
        return unauthorized("Missing request signature");
    };

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_SIGNED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Failed to buffer request body for signing: {}", e);
            return unauthorized("Unreadable request body");
        }
    };

    let message = canonical_message(&method, &path, timestamp, &bytes);
    if !verify_signature(&config.shared_secret, &message, &signature) {
        tracing::debug!(%method, %path, "Rejected request with invalid signature");
        return unauthorized("Invalid request signature");
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}
