//! Wire schema shared by every binding: a JSON object with `message_id`,
//! `send_timestamp` (float seconds), `vehicle_id` and `message_type`. Any other
//! field is class-specific and kept opaque.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use v2x_core::MessageClass;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message_type: {0}")]
    UnknownClass(String),
    #[error("send_timestamp is not finite")]
    BadTimestamp,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    message_id: String,
    send_timestamp: f64,
    vehicle_id: String,
    message_type: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub message_id: String,
    pub send_timestamp: f64,
    pub vehicle_id: String,
    pub message_class: MessageClass,
    pub extra: Map<String, Value>,
}

impl WireMessage {
    /// Producer/class scoped sequence number carried in the id's last segment.
    pub fn sequence(&self) -> Option<u64> {
        sequence_number(&self.message_id)
    }
}

pub fn decode(payload: &[u8]) -> Result<WireMessage, DecodeError> {
    let raw: RawMessage = serde_json::from_slice(payload)?;
    let message_class = MessageClass::parse(&raw.message_type)
        .ok_or_else(|| DecodeError::UnknownClass(raw.message_type.clone()))?;
    if !raw.send_timestamp.is_finite() {
        return Err(DecodeError::BadTimestamp);
    }
    Ok(WireMessage {
        message_id: raw.message_id,
        send_timestamp: raw.send_timestamp,
        vehicle_id: raw.vehicle_id,
        message_class,
        extra: raw.extra,
    })
}

/// Parses `<CLASS>_<PRODUCER>_..._<SEQ>`; at least three segments are required
/// and the trailing one must be an unsigned integer.
pub fn sequence_number(message_id: &str) -> Option<u64> {
    let mut parts = message_id.rsplit('_');
    let last = parts.next()?;
    if parts.count() < 2 {
        return None;
    }
    last.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_telemetry_and_keeps_extra_fields() {
        let payload = br#"{"message_id":"TEL_VEH_001_42","send_timestamp":1700000000.5,
            "vehicle_id":"VEH_001","message_type":"telemetry","speed":42.5,"latitude":37.7}"#;
        let msg = decode(payload).expect("decode");
        assert_eq!(msg.message_class, MessageClass::Telemetry);
        assert_eq!(msg.sequence(), Some(42));
        assert_eq!(msg.extra.get("speed"), Some(&serde_json::json!(42.5)));
    }

    #[test]
    fn rejects_missing_fields_and_unknown_classes() {
        let missing = br#"{"message_id":"TEL_V_1","vehicle_id":"V","message_type":"telemetry"}"#;
        assert!(matches!(decode(missing), Err(DecodeError::Json(_))));

        let unknown = br#"{"message_id":"X_V_1","send_timestamp":1.0,"vehicle_id":"V","message_type":"diagnostic"}"#;
        assert!(matches!(decode(unknown), Err(DecodeError::UnknownClass(c)) if c == "diagnostic"));

        assert!(decode(b"\xff\xfe not json").is_err());
    }

    #[test]
    fn sequence_is_the_trailing_integer() {
        assert_eq!(sequence_number("SAF_VEH_001_7"), Some(7));
        assert_eq!(sequence_number("TEL_V2_15"), Some(15));
        assert_eq!(sequence_number("TEL_15"), None);
        assert_eq!(sequence_number("TEL_VEH_001_x"), None);
        assert_eq!(sequence_number("TEL_VEH_001_-3"), None);
        assert_eq!(sequence_number("unknown"), None);
    }
}
