//! Webhook signature verification.
//!
//! The payment provider signs every webhook POST with an HMAC-SHA256 of the
//! raw body under a shared secret, hex-encoded in the `x-payment-signature`
//! header. Verification must happen before the body is parsed.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider's signature.
pub const SIGNATURE_HEADER: &str = "x-payment-signature";

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    /// An unusable secret is a startup failure, never a per-request one.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.iter().all(u8::is_ascii_whitespace) {
            return Err(AppError::Signature("webhook secret is empty".to_string()));
        }
        HmacSha256::new_from_slice(&secret).map_err(|e| AppError::Signature(e.to_string()))?;
        Ok(Self { secret })
    }

    /// `true` iff `signature_header` is the hex HMAC of `raw_body`.
    ///
    /// Malformed headers are a mismatch, not an error. The digest comparison
    /// is constant-time.
    pub fn verify(&self, raw_body: &[u8], signature_header: &str) -> bool {
        let Ok(expected) = hex::decode(signature_header.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }

    #[cfg(test)]
    pub fn sign(&self, raw_body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(raw_body);
        hex::encode(mac.finalize().into_bytes())
    }
}
