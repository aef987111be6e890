use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Build the canonical message that gets signed:
/// `METHOD + PATH + TIMESTAMP [+ body if non-empty]`.
///
/// The method is uppercased and the path excludes the query string. The body
/// is the raw JSON bytes as sent; any single-character change invalidates
/// the signature.
pub fn canonical_message(method: &str, path: &str, timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(method.len() + path.len() + 24 + body.len());
    message.extend_from_slice(method.to_ascii_uppercase().as_bytes());
    message.extend_from_slice(path.as_bytes());
    message.extend_from_slice(timestamp.to_string().as_bytes());
    if !body.is_empty() {
        message.extend_from_slice(body);
    }
    message
}

/// Sign a canonical message with the shared secret, returning the
/// hex-encoded HMAC-SHA256 signature.
pub fn sign_message(secret: &str, message: &[u8]) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail for SHA-256.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded signature against a canonical message.
///
/// Uses the MAC's constant-time comparison; malformed hex simply fails.
pub fn verify_signature(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    mac.update(message);
    mac.verify_slice(&signature).is_ok()
}
