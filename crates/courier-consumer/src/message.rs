//! Broker message parsing.
//!
//! Producers publish `{"id": ..., "event": ..., "data": ...}`. Older
//! producers use `eventId` and `eventType`; both spellings are accepted.
//! When the event type is missing the broker routing key stands in for it.
//! `data` is kept as raw JSON and never interpreted.

use courier_core::EventId;
use serde::Deserialize;
use serde_json::{value::RawValue, Value};

use crate::error::{ConsumerError, Result};

/// An event ready for fan-out.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Producer-assigned idempotency key.
    pub id: EventId,
    /// Dot-namespaced event type.
    pub event_type: String,
    /// Event payload exactly as the producer sent it.
    pub data: Box<RawValue>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default, alias = "eventId")]
    id: Option<Value>,
    #[serde(default, alias = "eventType")]
    event: Option<String>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// Parses a broker message body.
///
/// Numeric ids are accepted and converted to their decimal string. A missing
/// or `null` `data` becomes JSON `null`.
///
/// # Errors
///
/// Returns `MalformedMessage` when the body is not a JSON object, the id is
/// missing or empty, or no event type is available from either the body or
/// `routing_key`.
pub fn parse_message(payload: &[u8], routing_key: Option<&str>) -> Result<EventMessage> {
    let wire: WireMessage = serde_json::from_slice(payload)
        .map_err(|e| ConsumerError::malformed(format!("invalid JSON: {e}")))?;

    let id = match wire.id {
        Some(Value::String(id)) if !id.trim().is_empty() => id,
        Some(Value::Number(id)) => id.to_string(),
        Some(other) if !other.is_null() => {
            return Err(ConsumerError::malformed(format!("unsupported event id: {other}")));
        },
        _ => return Err(ConsumerError::malformed("missing event id")),
    };

    let event_type = wire
        .event
        .filter(|event| !event.trim().is_empty())
        .or_else(|| routing_key.filter(|key| !key.trim().is_empty()).map(str::to_string))
        .ok_or_else(|| ConsumerError::malformed(format!("event {id} has no event type")))?;

    let data = match wire.data {
        Some(data) => data,
        None => RawValue::from_string("null".to_string())
            .map_err(|e| ConsumerError::malformed(format!("invalid data: {e}")))?,
    };

    Ok(EventMessage { id: EventId::new(id), event_type, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_message() {
        let body = br#"{"id":"evt_1","event":"user.created","data":{"b":1,"a":2}}"#;

        let message = parse_message(body, None).unwrap();

        assert_eq!(message.id.as_str(), "evt_1");
        assert_eq!(message.event_type, "user.created");
        assert_eq!(message.data.get(), r#"{"b":1,"a":2}"#);
    }

    #[test]
    fn accepts_aliased_fields() {
        let body = br#"{"eventId":"evt_2","eventType":"order.paid","data":[1,2]}"#;

        let message = parse_message(body, None).unwrap();

        assert_eq!(message.id.as_str(), "evt_2");
        assert_eq!(message.event_type, "order.paid");
    }

    #[test]
    fn routing_key_fills_missing_event_type() {
        let body = br#"{"id":"evt_3","data":{}}"#;

        let message = parse_message(body, Some("invoice.sent")).unwrap();

        assert_eq!(message.event_type, "invoice.sent");
    }

    #[test]
    fn body_event_type_wins_over_routing_key() {
        let body = br#"{"id":"evt_3","event":"user.deleted","data":{}}"#;

        let message = parse_message(body, Some("fallback.key")).unwrap();

        assert_eq!(message.event_type, "user.deleted");
    }

    #[test]
    fn numeric_id_and_missing_data_are_tolerated() {
        let message = parse_message(br#"{"id":42,"event":"user.created"}"#, None).unwrap();

        assert_eq!(message.id.as_str(), "42");
        assert_eq!(message.data.get(), "null");
    }

    #[test]
    fn rejects_unusable_messages() {
        let cases: [(&[u8], Option<&str>); 6] = [
            (b"not json", None),
            (b"[1,2,3]", None),
            (br#"{"event":"user.created"}"#, None),
            (br#"{"id":"","event":"user.created"}"#, None),
            (br#"{"id":{"nested":true},"event":"user.created"}"#, None),
            (br#"{"id":"evt_1"}"#, Some("  ")),
        ];

        for (body, routing_key) in cases {
            let result = parse_message(body, routing_key);
            assert!(
                matches!(result, Err(ConsumerError::MalformedMessage { .. })),
                "expected malformed for {}",
                String::from_utf8_lossy(body)
            );
        }
    }
}
