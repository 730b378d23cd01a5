//! Per-source signature verification at the HTTP boundary (spec §4.5).
//! Every variant rejects by returning [`PipelineError::Signature`]; none
//! of them stage anything, so a rejection never reaches the Event Store.

use hmac::{Hmac, Mac};
use http::HeaderMap;
use lw_core::PipelineError;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Maximum tolerated skew between a signature's timestamp and now.
const MAX_SKEW_SECS: i64 = 300;

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), PipelineError>;
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `t=<unix_seconds>,v1=<hex>` verifier. Rejects missing header, expired
/// timestamp, malformed format, and MAC mismatch.
pub struct HmacTimestampVerifier {
    secret: String,
    header: String,
}

impl HmacTimestampVerifier {
    pub fn new(secret: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            header: header.into(),
        }
    }

    fn parse(value: &str) -> Option<(i64, String)> {
        let mut ts = None;
        let mut v1 = None;
        for part in value.split(',') {
            let mut kv = part.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("t"), Some(v)) => ts = v.parse::<i64>().ok(),
                (Some("v1"), Some(v)) => v1 = Some(v.to_string()),
                _ => {}
            }
        }
        Some((ts?, v1?))
    }
}

impl SignatureVerifier for HmacTimestampVerifier {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), PipelineError> {
        let raw = header_str(headers, &self.header).ok_or(PipelineError::Signature)?;
        let (ts, v1) = Self::parse(raw).ok_or(PipelineError::Signature)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - ts).abs() > MAX_SKEW_SECS {
            return Err(PipelineError::Signature);
        }
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| PipelineError::Signature)?;
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected.as_bytes().ct_eq(v1.as_bytes()).into() {
            Ok(())
        } else {
            Err(PipelineError::Signature)
        }
    }
}

/// Plain shared-secret header comparison, constant-time.
pub struct SharedSecretVerifier {
    secret: String,
    header: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            header: header.into(),
        }
    }
}

impl SignatureVerifier for SharedSecretVerifier {
    fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> Result<(), PipelineError> {
        let provided = header_str(headers, &self.header).ok_or(PipelineError::Signature)?;
        if provided.as_bytes().ct_eq(self.secret.as_bytes()).into() {
            Ok(())
        } else {
            Err(PipelineError::Signature)
        }
    }
}

/// Pass-through verifier used only when a source has no configured
/// secret. Logs a warning once at construction so the gap is visible in
/// process logs at startup.
pub struct NoneVerifier;

impl NoneVerifier {
    pub fn new(source: &str) -> Self {
        tracing::warn!(source, "no signature secret configured; accepting all requests unverified");
        Self
    }
}

impl SignatureVerifier for NoneVerifier {
    fn verify(&self, _headers: &HeaderMap, _body: &[u8]) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn sign(secret: &str, ts: i64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn hmac_timestamp_accepts_valid_signature() {
        let secret = "s3cr3t";
        let body = br#"{"a":1}"#;
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        let v1 = sign(secret, ts, body);
        let mut headers = HeaderMap::new();
        headers.insert(
            "calendar-signature",
            HeaderValue::from_str(&format!("t={ts},v1={v1}")).unwrap(),
        );
        let verifier = HmacTimestampVerifier::new(secret, "calendar-signature");
        assert!(verifier.verify(&headers, body).is_ok());
    }

    #[test]
    fn hmac_timestamp_rejects_stale_timestamp() {
        let secret = "s3cr3t";
        let body = b"payload";
        let ts = OffsetDateTime::now_utc().unix_timestamp() - 10_000;
        let v1 = sign(secret, ts, body);
        let mut headers = HeaderMap::new();
        headers.insert(
            "calendar-signature",
            HeaderValue::from_str(&format!("t={ts},v1={v1}")).unwrap(),
        );
        let verifier = HmacTimestampVerifier::new(secret, "calendar-signature");
        assert_eq!(verifier.verify(&headers, body), Err(PipelineError::Signature));
    }

    #[test]
    fn hmac_timestamp_rejects_missing_header() {
        let verifier = HmacTimestampVerifier::new("s", "calendar-signature");
        assert_eq!(verifier.verify(&HeaderMap::new(), b"x"), Err(PipelineError::Signature));
    }

    #[test]
    fn shared_secret_accepts_matching_and_rejects_mismatched() {
        let verifier = SharedSecretVerifier::new("expected", "x-meeting-secret");
        let mut headers = HeaderMap::new();
        headers.insert("x-meeting-secret", HeaderValue::from_static("expected"));
        assert!(verifier.verify(&headers, b"").is_ok());

        let mut bad = HeaderMap::new();
        bad.insert("x-meeting-secret", HeaderValue::from_static("wrong"));
        assert_eq!(verifier.verify(&bad, b""), Err(PipelineError::Signature));
    }

    #[test]
    fn none_verifier_always_passes() {
        let verifier = NoneVerifier::new("support_tag");
        assert!(verifier.verify(&HeaderMap::new(), b"anything").is_ok());
    }
}
