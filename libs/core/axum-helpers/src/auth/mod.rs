//! Signed-secret request authentication.
//!
//! Inbound requests carry an HMAC-SHA256 signature over a canonical message
//! (`METHOD + PATH + TIMESTAMP [+ body]`) plus a unix-seconds timestamp
//! header. The timestamp window is the sole replay protection: there is no
//! nonce cache, so a captured request can be replayed verbatim inside the
//! window. Whether that is acceptable depends on the deployment; do not add
//! a nonce store here without revisiting that decision upstream.

mod config;
mod middleware;
mod signature;

pub use config::{AuthMethod, SignatureAuthConfig};
pub use middleware::signature_auth_middleware;
pub use signature::{canonical_message, sign_message, verify_signature};

/// Header carrying the request timestamp, unix seconds.
pub const TIMESTAMP_HEADER: &str = "x-request-timestamp";

/// Header carrying the client certificate forwarded by the ingress
/// (mTLS mode only; the actual certificate validation is infrastructure's).
pub const CLIENT_CERT_HEADER: &str = "x-forwarded-client-cert";

/// Authorization scheme prefix for signed requests.
pub const HMAC_SCHEME: &str = "HMAC ";
