//! `x-signature: ts=<unix>,v1=<hex>` verification.
//!
//! The signed string is `id:{payment_id};request-id:{request_id};ts:{ts};`
//! keyed with the shared secret (HMAC-SHA256, hex). Checks run in a fixed
//! order and stop at the first failure, before any state is touched.

use std::time::Duration;

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::AuthenticityError;
pub use crate::middleware_helpers::request_id::REQUEST_ID_HEADER;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

fn canonical(payment_id: &str, request_id: &str, ts: i64) -> String {
    format!("id:{payment_id};request-id:{request_id};ts:{ts};")
}

fn mac_for(secret: &str, message: &str) -> Result<HmacSha256, AuthenticityError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthenticityError::SecretNotConfigured)?;
    mac.update(message.as_bytes());
    Ok(mac)
}

/// Produces signature headers the way the provider does.
pub struct SignatureGenerator {
    secret: String,
}

impl SignatureGenerator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hex digest for the canonical string.
    pub fn sign(&self, payment_id: &str, request_id: &str, ts: i64) -> String {
        match mac_for(&self.secret, &canonical(payment_id, request_id, ts)) {
            Ok(mac) => hex::encode(mac.finalize().into_bytes()),
            Err(_) => String::new(),
        }
    }

    /// Full `x-signature` header value.
    pub fn header_value(&self, payment_id: &str, request_id: &str, ts: i64) -> String {
        format!("ts={ts},v1={}", self.sign(payment_id, request_id, ts))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SignatureParts {
    ts: String,
    v1: String,
}

/// Splits `ts=..,v1=..`; segments without `=` are ignored, segments with
/// more than one are malformed.
fn parse_signature(raw: &str) -> Result<SignatureParts, AuthenticityError> {
    let mut ts = None;
    let mut v1 = None;
    for part in raw.split(',').map(str::trim).filter(|p| p.contains('=')) {
        let mut kv = part.split('=');
        let (Some(key), Some(value), None) = (kv.next(), kv.next(), kv.next()) else {
            return Err(AuthenticityError::InvalidSignatureFormat);
        };
        match key.trim() {
            "ts" => ts = Some(value.trim().to_string()),
            "v1" => v1 = Some(value.trim().to_string()),
            _ => {}
        }
    }
    match (ts, v1) {
        (Some(ts), Some(v1)) if !ts.is_empty() && !v1.is_empty() => Ok(SignatureParts { ts, v1 }),
        _ => Err(AuthenticityError::InvalidSignatureFields),
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            tolerance,
        }
    }

    /// Verifies the headers of one notification against `payment_id`.
    pub fn verify(&self, headers: &HeaderMap, payment_id: &str, now: i64) -> Result<(), AuthenticityError> {
        let (Some(signature), Some(request_id)) = (
            header_value(headers, SIGNATURE_HEADER),
            header_value(headers, REQUEST_ID_HEADER),
        ) else {
            return Err(AuthenticityError::MissingSignatureHeaders);
        };

        let parts = parse_signature(signature)?;
        let ts: i64 = parts
            .ts
            .parse()
            .map_err(|_| AuthenticityError::InvalidTimestamp)?;
        if now.abs_diff(ts) > self.tolerance.as_secs() {
            return Err(AuthenticityError::TimestampOutOfWindow);
        }

        let secret = self
            .secret
            .as_deref()
            .ok_or(AuthenticityError::SecretNotConfigured)?;
        let provided = hex::decode(&parts.v1).map_err(|_| AuthenticityError::InvalidSignature)?;
        mac_for(secret, &canonical(payment_id, request_id, ts))?
            .verify_slice(&provided)
            .map_err(|_| AuthenticityError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(Some(SECRET.into()), Duration::from_secs(300))
    }

    fn headers(signature: Option<&str>, request_id: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(s) = signature {
            h.insert(SIGNATURE_HEADER, HeaderValue::from_str(s).unwrap());
        }
        if let Some(r) = request_id {
            h.insert(REQUEST_ID_HEADER, HeaderValue::from_str(r).unwrap());
        }
        h
    }

    fn signed(payment_id: &str, ts: i64) -> HeaderMap {
        let value = SignatureGenerator::new(SECRET).header_value(payment_id, "req-1", ts);
        headers(Some(&value), Some("req-1"))
    }

    #[test]
    fn canonical_string_layout() {
        assert_eq!(canonical("P1", "r", 5), "id:P1;request-id:r;ts:5;");
    }

    #[test]
    fn valid_signature_passes() {
        assert!(verifier().verify(&signed("P1", NOW), "P1", NOW).is_ok());
        assert!(verifier().verify(&signed("P1", NOW - 299), "P1", NOW).is_ok());
    }

    #[test]
    fn signature_is_bound_to_payment_id() {
        assert_matches!(
            verifier().verify(&signed("P1", NOW), "P2", NOW),
            Err(AuthenticityError::InvalidSignature)
        );
    }

    #[test]
    fn missing_headers() {
        assert_matches!(
            verifier().verify(&headers(None, Some("r")), "P1", NOW),
            Err(AuthenticityError::MissingSignatureHeaders)
        );
        assert_matches!(
            verifier().verify(&headers(Some("ts=1,v1=ab"), None), "P1", NOW),
            Err(AuthenticityError::MissingSignatureHeaders)
        );
    }

    #[test]
    fn malformed_segment() {
        assert_matches!(
            verifier().verify(&headers(Some("ts=1=2,v1=ab"), Some("r")), "P1", NOW),
            Err(AuthenticityError::InvalidSignatureFormat)
        );
    }

    #[test]
    fn missing_fields() {
        assert_matches!(
            verifier().verify(&headers(Some("ts=1"), Some("r")), "P1", NOW),
            Err(AuthenticityError::InvalidSignatureFields)
        );
        assert_matches!(
            verifier().verify(&headers(Some("garbage"), Some("r")), "P1", NOW),
            Err(AuthenticityError::InvalidSignatureFields)
        );
    }

    #[test]
    fn non_numeric_timestamp() {
        assert_matches!(
            verifier().verify(&headers(Some("ts=abc,v1=ab"), Some("r")), "P1", NOW),
            Err(AuthenticityError::InvalidTimestamp)
        );
    }

    #[test]
    fn stale_and_future_timestamps() {
        assert_matches!(
            verifier().verify(&signed("P1", NOW - 301), "P1", NOW),
            Err(AuthenticityError::TimestampOutOfWindow)
        );
        assert_matches!(
            verifier().verify(&signed("P1", NOW + 301), "P1", NOW),
            Err(AuthenticityError::TimestampOutOfWindow)
        );
    }

    #[test]
    fn window_is_checked_before_secret() {
        let unconfigured = SignatureVerifier::new(None, Duration::from_secs(300));
        assert_matches!(
            unconfigured.verify(&signed("P1", NOW - 1000), "P1", NOW),
            Err(AuthenticityError::TimestampOutOfWindow)
        );
        assert_matches!(
            unconfigured.verify(&signed("P1", NOW), "P1", NOW),
            Err(AuthenticityError::SecretNotConfigured)
        );
    }

    #[test]
    fn non_hex_digest_is_invalid_signature() {
        let value = format!("ts={NOW},v1=zz");
        assert_matches!(
            verifier().verify(&headers(Some(&value), Some("r")), "P1", NOW),
            Err(AuthenticityError::InvalidSignature)
        );
    }
}
