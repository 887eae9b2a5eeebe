//! HMAC-SHA256 request signatures
//!
//! The signature covers the raw request body exactly as received. Callers
//! send it in the `x-signature` header either as bare hex or `sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Optional algorithm prefix accepted on the header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Hex-encoded HMAC-SHA256 of `body` under `secret`
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Header value in the prefixed form
pub fn signature_header_value(secret: &[u8], body: &[u8]) -> String {
    format!("{}{}", SIGNATURE_PREFIX, sign(secret, body))
}

/// Constant-time check of `signature` against the HMAC of `body`
///
/// Returns `false` for an empty secret, undecodable hex or any mismatch.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }

    let hex_sig = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or_else(|| signature.trim());
    let provided = match hex::decode(hex_sig) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}
