//! Request signature generation and verification.
//!
//! The wire contract is HMAC-SHA256 over the canonical payload
//!
//! ```text
//! actionType|namespace|resourceType|resourceName|timestamp
//! ```
//!
//! encoded as lower-case hex. Verification and generation share
//! [`canonical_payload`] so they cannot drift apart.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::models::{ActionRequest, ActionType};

type HmacSha256 = Hmac<Sha256>;

/// Separator between canonical payload fields.
pub const CANONICAL_DELIMITER: char = '|';

/// The five signed fields of a request, borrowed.
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    pub action_type: ActionType,
    pub namespace: &'a str,
    pub resource_type: &'a str,
    pub resource_name: &'a str,
    pub timestamp: &'a str,
}

impl<'a> From<&'a ActionRequest> for SignedFields<'a> {
    fn from(request: &'a ActionRequest) -> Self {
        Self {
            action_type: request.action_type,
            namespace: &request.namespace,
            resource_type: &request.resource_type,
            resource_name: &request.resource_name,
            timestamp: &request.timestamp,
        }
    }
}

/// Build the fixed-order, delimiter-joined payload a signature covers.
#[must_use]
pub fn canonical_payload(fields: SignedFields<'_>) -> String {
    [
        fields.action_type.as_str(),
        fields.namespace,
        fields.resource_type,
        fields.resource_name,
        fields.timestamp,
    ]
    .join(&CANONICAL_DELIMITER.to_string())
}

/// A delimiter inside a field would let two different requests share one
/// canonical payload.
#[must_use]
pub fn contains_delimiter(fields: SignedFields<'_>) -> bool {
    [
        fields.namespace,
        fields.resource_type,
        fields.resource_name,
        fields.timestamp,
    ]
    .iter()
    .any(|field| field.contains(CANONICAL_DELIMITER))
}

/// Holds the shared signing secret and computes / checks signatures.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Arc<[u8]>,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    fn mac(&self, payload: &str) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(payload.as_bytes());
        Some(mac)
    }

    /// Hex-encoded signature for the given fields.
    #[must_use]
    pub fn sign(&self, fields: SignedFields<'_>) -> String {
        self.mac(&canonical_payload(fields))
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default()
    }

    /// Check the request's presented signature against its canonical payload.
    ///
    /// Returns `false` for missing, malformed or mismatched signatures.
    #[must_use]
    pub fn verify(&self, request: &ActionRequest) -> bool {
        self.verify_fields(SignedFields::from(request), &request.signature)
    }

    #[must_use]
    pub fn verify_fields(&self, fields: SignedFields<'_>, signature: &str) -> bool {
        if signature.is_empty() || contains_delimiter(fields) {
            return false;
        }
        let Ok(signature_bytes) = hex::decode(signature) else {
            return false;
        };
        let Some(mac) = self.mac(&canonical_payload(fields)) else {
            return false;
        };
        let computed = mac.finalize().into_bytes();

        // Constant-time comparison to prevent timing attacks
        computed.as_slice().ct_eq(&signature_bytes).into()
    }
}

/// Parse a request timestamp: RFC 3339 or integer epoch milliseconds.
#[must_use]
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    let trimmed = timestamp.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    trimmed
        .parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

/// Whether `timestamp` lies within `max_age` of `now`, in either direction.
#[must_use]
pub fn is_fresh(timestamp: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
    let Some(sent_at) = parse_timestamp(timestamp) else {
        return false;
    };
    let Ok(max_age) = chrono::Duration::from_std(max_age) else {
        return false;
    };
    (now - sent_at).abs() <= max_age
}
