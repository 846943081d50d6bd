//! The wire envelope.
//!
//! Every message on a connection is one [`Envelope`]: a correlation id, a
//! creation timestamp and a [`Body`] tagged by `kind`.
//!
//! ```text
//! { "id": "…", "kind": "request", "createdAt": 1718000000000,
//!   "operation": "echo", "arguments": { "x": 1 } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One complete message unit exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id, chosen by the request sender and echoed by the responder.
    pub id: String,
    /// Milliseconds since the Unix epoch. Diagnostics only.
    #[serde(rename = "createdAt", default)]
    pub created_at: f64,
    #[serde(flatten)]
    pub body: Body,
}

/// Kind-specific payload of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Body {
    Request {
        operation: String,
        arguments: Value,
    },
    Result {
        operation: String,
        value: Value,
        ok: bool,
    },
    Fault {
        /// Absent when the fault concerns the connection rather than a request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
        message: String,
        #[serde(rename = "faultCode")]
        fault_code: FaultCode,
    },
}

impl Envelope {
    /// Create a request with a fresh correlation id.
    pub fn request(operation: impl Into<String>, arguments: Value) -> Self {
        Self::with_id(
            new_id(),
            Body::Request {
                operation: operation.into(),
                arguments,
            },
        )
    }

    /// Create a result answering the request `id`.
    pub fn result(
        id: impl Into<String>,
        operation: impl Into<String>,
        value: Value,
        ok: bool,
    ) -> Self {
        Self::with_id(
            id.into(),
            Body::Result {
                operation: operation.into(),
                value,
                ok,
            },
        )
    }

    /// Create a request-scoped fault answering the request `id`.
    pub fn fault(
        id: impl Into<String>,
        operation: Option<String>,
        fault_code: FaultCode,
        message: impl Into<String>,
    ) -> Self {
        Self::with_id(
            id.into(),
            Body::Fault {
                operation,
                message: message.into(),
                fault_code,
            },
        )
    }

    /// Create a connection-scoped fault (no operation).
    ///
    /// Uses `id` when the offending message carried one, otherwise a fresh id.
    pub fn connection_fault(
        id: Option<String>,
        fault_code: FaultCode,
        message: impl Into<String>,
    ) -> Self {
        Self::fault(id.unwrap_or_else(new_id), None, fault_code, message)
    }

    fn with_id(id: String, body: Body) -> Self {
        Self {
            id,
            created_at: chrono::Utc::now().timestamp_millis() as f64,
            body,
        }
    }

    /// Wire name of the envelope kind.
    pub fn kind(&self) -> &'static str {
        match self.body {
            Body::Request { .. } => "request",
            Body::Result { .. } => "result",
            Body::Fault { .. } => "fault",
        }
    }

    /// Operation name, if the envelope carries one.
    pub fn operation(&self) -> Option<&str> {
        match &self.body {
            Body::Request { operation, .. } | Body::Result { operation, .. } => Some(operation),
            Body::Fault { operation, .. } => operation.as_deref(),
        }
    }
}

/// Generate a fresh correlation id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fault code carried by `fault` envelopes.
///
/// The set is open: codes this crate does not know are kept verbatim in
/// [`FaultCode::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FaultCode {
    DecodeError,
    Unsupported,
    UnknownOperation,
    HandlerError,
    HandlerTimeout,
    InvalidArguments,
    ConnectionLimit,
    InternalError,
    Other(String),
}

impl FaultCode {
    pub fn as_str(&self) -> &str {
        match self {
            FaultCode::DecodeError => "decode-error",
            FaultCode::Unsupported => "unsupported",
            FaultCode::UnknownOperation => "unknown-operation",
            FaultCode::HandlerError => "handler-error",
            FaultCode::HandlerTimeout => "handler-timeout",
            FaultCode::InvalidArguments => "invalid-arguments",
            FaultCode::ConnectionLimit => "connection-limit",
            FaultCode::InternalError => "internal-error",
            FaultCode::Other(code) => code,
        }
    }
}

impl From<String> for FaultCode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "decode-error" => FaultCode::DecodeError,
            "unsupported" => FaultCode::Unsupported,
            "unknown-operation" => FaultCode::UnknownOperation,
            "handler-error" => FaultCode::HandlerError,
            "handler-timeout" => FaultCode::HandlerTimeout,
            "invalid-arguments" => FaultCode::InvalidArguments,
            "connection-limit" => FaultCode::ConnectionLimit,
            "internal-error" => FaultCode::InternalError,
            _ => FaultCode::Other(s),
        }
    }
}

impl From<&str> for FaultCode {
    fn from(s: &str) -> Self {
        FaultCode::from(s.to_string())
    }
}

impl From<FaultCode> for String {
    fn from(code: FaultCode) -> Self {
        match code {
            FaultCode::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_flat() {
        let env = Envelope::request("echo", json!({"x": 1}));
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["kind"], "request");
        assert_eq!(value["operation"], "echo");
        assert_eq!(value["arguments"], json!({"x": 1}));
        assert!(value["createdAt"].is_number());
        assert!(value.get("body").is_none());
    }

    #[test]
    fn test_connection_fault_omits_operation() {
        let env = Envelope::connection_fault(None, FaultCode::DecodeError, "bad");
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["kind"], "fault");
        assert_eq!(value["faultCode"], "decode-error");
        assert!(value.get("operation").is_none());
        assert!(!env.id.is_empty());
    }

    #[test]
    fn test_fault_code_open_set() {
        for code in [
            FaultCode::DecodeError,
            FaultCode::Unsupported,
            FaultCode::UnknownOperation,
            FaultCode::HandlerError,
            FaultCode::HandlerTimeout,
            FaultCode::InvalidArguments,
            FaultCode::ConnectionLimit,
            FaultCode::InternalError,
        ] {
            assert_eq!(FaultCode::from(code.as_str()), code);
        }
        assert_eq!(
            FaultCode::from("rate-limited"),
            FaultCode::Other("rate-limited".to_string())
        );
        assert_eq!(String::from(FaultCode::from("rate-limited")), "rate-limited");
    }

    #[test]
    fn test_fresh_ids_are_unique() {
        let a = Envelope::request("echo", Value::Null);
        let b = Envelope::request("echo", Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_operation_accessor() {
        let result = Envelope::result("1", "echo", Value::Null, true);
        assert_eq!(result.operation(), Some("echo"));
        assert_eq!(result.kind(), "result");

        let fault = Envelope::connection_fault(None, FaultCode::Unsupported, "no");
        assert_eq!(fault.operation(), None);
    }
}
