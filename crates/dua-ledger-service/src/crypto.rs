//! Signature helpers for provider callbacks.
//!
//! Callbacks carry an HMAC-SHA256 of the raw request body, hex encoded, in
//! the `x-webhook-signature` header. A `sha256=` prefix is accepted.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix some senders put in front of the hex digest.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute HMAC-SHA256 over `message` and return it hex encoded.
///
/// # Errors
///
/// Returns `InvalidLength` if the key is rejected. HMAC accepts keys of any
/// size, so this does not happen with the `sha2` backend.
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check a callback signature header against the raw body.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let provided = header.trim();
    let provided = provided.strip_prefix(SIGNATURE_PREFIX).unwrap_or(provided);
    let Ok(expected) = hmac_sha256_hex(secret.as_bytes(), body) else {
        return false;
    };
    constant_time_eq(&expected, &provided.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_known_vector() {
        // RFC 4231 test case 2.
        let digest = hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            digest,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn constant_time_eq_compares_content_and_length() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn verify_accepts_bare_and_prefixed_signatures() {
        let body = br#"{"code":200}"#;
        let sig = hmac_sha256_hex(b"secret", body).unwrap();

        assert!(verify_signature("secret", body, &sig));
        assert!(verify_signature("secret", body, &format!("sha256={sig}")));
        assert!(verify_signature("secret", body, &sig.to_uppercase()));
    }

    #[test]
    fn verify_rejects_wrong_secret_or_body() {
        let body = br#"{"code":200}"#;
        let sig = hmac_sha256_hex(b"secret", body).unwrap();

        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("secret", br#"{"code":500}"#, &sig));
        assert!(!verify_signature("secret", body, "not-hex"));
    }
}
