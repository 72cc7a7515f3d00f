//! Envelope construction and HMAC-SHA256 signing.
//!
//! The envelope is serialized exactly once, when a delivery is created. Those
//! bytes are stored, signed and sent unchanged on every attempt, so the
//! signature always covers what the receiver gets.
//!
//! Signatures use the `sha256=<hex>` format carried in the
//! `X-Webhook-Signature` header.

use chrono::{DateTime, SecondsFormat, Utc};
use courier_core::{EventId, SigningSecret};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use serde_json::value::RawValue;
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature produced by [`sign`].
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Secret length used by [`generate_secret`] callers that have no preference.
pub const DEFAULT_SECRET_BYTES: usize = 32;

#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a str,
    event: &'a str,
    timestamp: String,
    data: &'a RawValue,
}

/// Serializes the `{id, event, timestamp, data}` envelope.
///
/// `timestamp` is the envelope creation time, not the original event time.
/// `data` is embedded byte for byte.
///
/// # Errors
///
/// Returns `InvalidRequest` if serialization fails.
pub fn build_envelope(
    event_id: &EventId,
    event_type: &str,
    data: &RawValue,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let envelope = Envelope {
        id: event_id.as_str(),
        event: event_type,
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        data,
    };
    serde_json::to_string(&envelope)
        .map_err(|e| DeliveryError::invalid_request(format!("failed to serialize envelope: {e}")))
}

/// Signs `payload` with `secret`, returning `sha256=<hex>`.
///
/// # Errors
///
/// Returns `Configuration` if the secret cannot key the MAC.
pub fn sign(payload: &[u8], secret: &SigningSecret) -> Result<String> {
    let mut mac = keyed_mac(secret)?;
    mac.update(payload);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Checks `signature` against `payload` in constant time.
///
/// Returns false for a missing prefix, invalid hex, or any length or byte
/// mismatch.
pub fn verify(payload: &[u8], signature: &str, secret: &SigningSecret) -> bool {
    let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = keyed_mac(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Generates a random hex-encoded secret from `byte_length` random bytes.
pub fn generate_secret(byte_length: usize) -> SigningSecret {
    let mut bytes = vec![0u8; byte_length];
    rand::rng().fill_bytes(&mut bytes);
    SigningSecret::new(hex::encode(bytes))
}

fn keyed_mac(secret: &SigningSecret) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.expose().as_bytes())
        .map_err(|e| DeliveryError::configuration(format!("invalid signing key: {e}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    #[test]
    fn envelope_preserves_data_bytes_and_field_order() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let data = raw(r#"{"z":1,"a":[1.50,"x"]}"#);

        let envelope =
            build_envelope(&EventId::from("evt_1"), "user.created", &data, timestamp).unwrap();

        assert_eq!(
            envelope,
            r#"{"id":"evt_1","event":"user.created","timestamp":"2024-03-01T12:00:00.000Z","data":{"z":1,"a":[1.50,"x"]}}"#
        );
    }

    #[test]
    fn known_signature_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature =
            sign(b"The quick brown fox jumps over the lazy dog", &SigningSecret::new("key"))
                .unwrap();

        assert_eq!(
            signature,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn verify_accepts_own_signature() {
        let secret = SigningSecret::new("whsec_test");
        let signature = sign(b"payload", &secret).unwrap();

        assert!(verify(b"payload", &signature, &secret));
    }

    #[test]
    fn verify_rejects_malformed_signatures() {
        let secret = SigningSecret::new("whsec_test");
        let signature = sign(b"payload", &secret).unwrap();
        let hex_only = signature.trim_start_matches(SIGNATURE_PREFIX);

        assert!(!verify(b"payload", hex_only, &secret));
        assert!(!verify(b"payload", "sha256=not-hex", &secret));
        assert!(!verify(b"payload", &signature[..signature.len() - 2], &secret));
        assert!(!verify(b"payload", "sha256=", &secret));
    }

    #[test]
    fn generated_secrets_are_hex_and_unique() {
        let first = generate_secret(DEFAULT_SECRET_BYTES);
        let second = generate_secret(DEFAULT_SECRET_BYTES);

        assert_eq!(first.expose().len(), DEFAULT_SECRET_BYTES * 2);
        assert!(first.expose().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first.expose(), second.expose());
        assert_eq!(generate_secret(16).expose().len(), 32);
    }
}
