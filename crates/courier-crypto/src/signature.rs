//! Webhook signatures.
//!
//! The platform signs every delivery with HMAC-SHA256 over the raw request
//! body and sends it as `X-Hub-Signature-256: sha256=<hex>`. CRM forwards are
//! signed the same way, keyed by the account's own webhook secret.

use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the `sha256=<hex>` header value for `body`.
pub fn sign(body: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("Failed to create HMAC: {}", e))?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check `signature_header` against the HMAC of the exact raw `body`.
///
/// Returns `false` for a mismatch, an empty or malformed header, or an empty
/// secret. Never fails.
pub fn verify(body: &[u8], signature_header: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }

    let Some(hex_sig) = signature_header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    // verify_slice compares in constant time
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time byte comparison for bearer tokens.
///
/// Unequal lengths compare unequal; only the length leaks through timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_body_verifies() {
        let body = br#"{"object":"instagram","entry":[]}"#;
        let header = sign(body, "app_secret").unwrap();

        assert!(header.starts_with("sha256="));
        assert!(verify(body, &header, "app_secret"));
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign(b"original", "app_secret").unwrap();
        assert!(!verify(b"original ", &header, "app_secret"));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign(b"body", "app_secret").unwrap();
        assert!(!verify(b"body", &header, "other_secret"));
    }

    #[test]
    fn malformed_headers_fail_without_panicking() {
        let body = b"body";
        for header in [
            "",
            "sha256=",
            "sha1=abcdef",
            "sha256=zz-not-hex",
            "sha256=0000000000000000000000000000000000000000000000000000000000000000",
            "invalid_format",
        ] {
            assert!(!verify(body, header, "app_secret"), "accepted {header:?}");
        }
    }

    #[test]
    fn empty_secret_never_verifies() {
        let header = sign(b"body", "").unwrap();
        assert!(!verify(b"body", &header, ""));
    }

    #[test]
    fn constant_time_eq_matches_plain_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
    }
}
