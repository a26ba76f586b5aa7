//! HMAC-SHA256 webhook body signing (spec.md §4.4 step 3): "the same
//! `(secret, body)` pair always yields the same signature; different
//! secret or different body always yields a different signature."

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `"sha256=" + hex(HMAC_SHA256(secret, body))`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        assert_eq!(sign("s3cret", b"body"), sign("s3cret", b"body"));
    }

    #[test]
    fn differs_on_secret() {
        assert_ne!(sign("s3cret", b"body"), sign("other", b"body"));
    }

    #[test]
    fn differs_on_body() {
        assert_ne!(sign("s3cret", b"body"), sign("s3cret", b"other body"));
    }

    #[test]
    fn has_sha256_prefix() {
        assert!(sign("s3cret", b"body").starts_with("sha256="));
    }
}
