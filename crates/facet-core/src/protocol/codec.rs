//! Envelope encoding and structural validation.
//!
//! Decoding never fails across the transport boundary with anything other
//! than a [`DecodeFault`]; the caller decides how to report it.

use super::envelope::Envelope;
use crate::{FacetError, Result};
use serde_json::Value;

/// Why a message could not be decoded into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFault {
    pub message: String,
    /// The `id` of the offending message, when it had a usable one.
    pub id: Option<String>,
}

impl std::fmt::Display for DecodeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DecodeFault {}

impl From<DecodeFault> for FacetError {
    fn from(fault: DecodeFault) -> Self {
        FacetError::Decode {
            message: fault.message,
        }
    }
}

/// Serialize an envelope to its wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse one complete wire message.
///
/// Unknown fields are ignored. Missing or mistyped `id`, `kind` or
/// kind-specific fields produce a [`DecodeFault`].
pub fn decode(bytes: &[u8]) -> std::result::Result<Envelope, DecodeFault> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| DecodeFault {
        message: format!("Invalid JSON: {}", e),
        id: None,
    })?;

    let Some(object) = value.as_object() else {
        return Err(DecodeFault {
            message: "Envelope must be a JSON object".to_string(),
            id: None,
        });
    };

    let id = object
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(String::from);

    if id.is_none() {
        return Err(DecodeFault {
            message: "Envelope is missing a non-empty string `id`".to_string(),
            id: None,
        });
    }

    serde_json::from_value(value).map_err(|e| DecodeFault {
        message: format!("Invalid envelope: {}", e),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, FaultCode};
    use serde_json::json;

    #[test]
    fn test_roundtrip_each_kind() {
        let envelopes = [
            Envelope::request("echo", json!({"x": 1, "nested": [1.5, null, "s"]})),
            Envelope::result("abc", "echo", json!({"x": 1}), true),
            Envelope::result("abc", "echo", json!("boom"), false),
            Envelope::fault("abc", Some("bogus".into()), FaultCode::UnknownOperation, "nope"),
            Envelope::connection_fault(None, FaultCode::Other("custom".into()), "x"),
        ];

        for env in envelopes {
            let bytes = encode(&env).unwrap();
            assert_eq!(decode(&bytes).unwrap(), env);
        }
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let bytes = br#"{"id":"1","kind":"request","createdAt":5,"operation":"echo",
            "arguments":{},"trace":"t-9"}"#;
        let env = decode(bytes).unwrap();

        assert_eq!(env.id, "1");
        assert_eq!(env.created_at, 5.0);
        assert!(matches!(env.body, Body::Request { ref operation, .. } if operation == "echo"));
    }

    #[test]
    fn test_decode_tolerates_missing_created_at() {
        let bytes = br#"{"id":"1","kind":"result","operation":"echo","value":null,"ok":true}"#;
        let env = decode(bytes).unwrap();
        assert_eq!(env.created_at, 0.0);
    }

    #[test]
    fn test_decode_invalid_json() {
        let fault = decode(b"not valid json").unwrap_err();
        assert!(fault.message.starts_with("Invalid JSON"));
        assert!(fault.id.is_none());
    }

    #[test]
    fn test_decode_non_utf8() {
        let fault = decode(&[0xff, 0xfe, 0x00, 0x7b]).unwrap_err();
        assert!(fault.id.is_none());
    }

    #[test]
    fn test_decode_non_object() {
        for bytes in [&b"[1,2]"[..], b"42", b"\"str\"", b"null"] {
            let fault = decode(bytes).unwrap_err();
            assert_eq!(fault.message, "Envelope must be a JSON object");
        }
    }

    #[test]
    fn test_decode_missing_id() {
        let fault = decode(br#"{"kind":"request","operation":"echo","arguments":{}}"#).unwrap_err();
        assert!(fault.message.contains("id"));

        let bytes = br#"{"id":7,"kind":"request","operation":"echo","arguments":{}}"#;
        let fault = decode(bytes).unwrap_err();
        assert!(fault.id.is_none());
    }

    #[test]
    fn test_decode_missing_kind_field_keeps_id() {
        let fault = decode(br#"{"id":"req-1","kind":"request","arguments":{}}"#).unwrap_err();
        assert_eq!(fault.id.as_deref(), Some("req-1"));
        assert!(fault.message.contains("operation"));

        let fault = decode(br#"{"id":"req-2","operation":"echo"}"#).unwrap_err();
        assert_eq!(fault.id.as_deref(), Some("req-2"));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let fault = decode(br#"{"id":"req-3","kind":"ping"}"#).unwrap_err();
        assert_eq!(fault.id.as_deref(), Some("req-3"));
    }

    #[test]
    fn test_decode_wrong_field_shape() {
        let bytes = br#"{"id":"r","kind":"result","operation":"echo","value":1,"ok":"yes"}"#;
        let fault = decode(bytes).unwrap_err();
        assert_eq!(fault.id.as_deref(), Some("r"));
    }

    #[test]
    fn test_decode_fault_converts_to_error() {
        let fault = decode(b"{").unwrap_err();
        let err: FacetError = fault.into();
        assert_eq!(err.fault_code(), FaultCode::DecodeError);
    }
}
