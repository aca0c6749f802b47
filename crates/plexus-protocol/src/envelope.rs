//! The client frame and its JSON codec.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ErrorPayload};
use crate::types::MessageType;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bus payload encode failed: {0}")]
    CborEncode(String),

    #[error("bus payload decode failed: {0}")]
    CborDecode(String),
}

/// A frame exchanged between a client and the gateway.
///
/// `sequence_id` is chosen by whoever originates a request and echoed on the
/// correlated response. Server-initiated pushes leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub sequence_id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build a frame from any serializable payload.
    pub fn new(
        sequence_id: impl Into<String>,
        message_type: MessageType,
        payload: impl Serialize,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            sequence_id: sequence_id.into(),
            message_type,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// A server push: no correlating sequence id.
    pub fn push(message_type: MessageType, payload: impl Serialize) -> Result<Self, CodecError> {
        Self::new(String::new(), message_type, payload)
    }

    pub fn error(sequence_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            message_type: MessageType::ErrorGeneric,
            payload: error_value(ErrorPayload::new(code, message)),
        }
    }

    pub fn validation_error(sequence_id: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            message_type: MessageType::ErrorValidation,
            payload: error_value(ErrorPayload::validation(fields)),
        }
    }

    /// Decode the payload into a concrete type. Unknown fields are ignored.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

fn error_value(payload: ErrorPayload) -> Value {
    // A struct of strings and a string map always serializes.
    serde_json::to_value(&payload).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_known_type_survives_the_wire() {
        for ty in MessageType::KNOWN {
            let frame = Envelope::new("s-1", ty.clone(), json!({"k": 1})).unwrap();
            let decoded = Envelope::decode(frame.encode().unwrap().as_bytes()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn unknown_type_decodes_as_tagged_unknown() {
        let decoded = Envelope::decode(br#"{"sequence_id":"q","type":"quux:frob","payload":{}}"#).unwrap();
        assert_eq!(decoded.message_type, MessageType::Unknown("quux:frob".into()));
        let again = Envelope::decode(decoded.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(again, decoded);
    }

    #[test]
    fn missing_sequence_and_payload_default() {
        let decoded = Envelope::decode(br#"{"type":"chat:get-chats"}"#).unwrap();
        assert_eq!(decoded.sequence_id, "");
        assert_eq!(decoded.payload, Value::Null);
    }

    #[test]
    fn unknown_envelope_fields_are_dropped() {
        let decoded = Envelope::decode(br#"{"type":"chat:mute","extra":true,"payload":{}}"#).unwrap();
        let encoded: Value = serde_json::from_str(&decoded.encode().unwrap()).unwrap();
        assert!(encoded.get("extra").is_none());
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"sequence_id":"a"}"#).is_err());
    }

    #[test]
    fn error_frame_shape() {
        let frame = Envelope::error("a", ErrorCode::BadRequest, "invalid chat type");
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "sequence_id": "a",
                "type": "error:generic",
                "payload": {"code": "bad_request", "error": "invalid chat type"}
            })
        );
    }

    #[test]
    fn validation_frame_names_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("chat_id".to_string(), "number".to_string());
        let frame = Envelope::validation_error("v", fields);
        assert_eq!(frame.message_type, MessageType::ErrorValidation);
        assert_eq!(frame.payload["code"], "validation");
        assert_eq!(frame.payload["validation_errors"]["chat_id"], "number");
    }
}
