//! Error types for the FACET transport.
//!
//! Every error here can be expressed on the wire as a [`FaultCode`], which is
//! how internal failures are converted before they cross a connection.

use crate::protocol::FaultCode;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the FACET transport and dispatcher.
#[derive(Debug, Error)]
pub enum FacetError {
    // Link errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to connect to {addr}: {message}")]
    ConnectFailed { addr: String, message: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // Wire errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Malformed envelope: {message}")]
    Decode { message: String },

    #[error("Message size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Remote faults, as reported by the peer
    #[error("{code}: {message}")]
    Fault { code: FaultCode, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for FACET operations.
pub type Result<T> = std::result::Result<T, FacetError>;

impl From<std::io::Error> for FacetError {
    fn from(err: std::io::Error) -> Self {
        FacetError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for FacetError {
    fn from(err: serde_json::Error) -> Self {
        FacetError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl FacetError {
    /// Build a remote fault error.
    pub fn fault(code: FaultCode, message: impl Into<String>) -> Self {
        FacetError::Fault {
            code,
            message: message.into(),
        }
    }

    /// Convert to the fault code used when this error is put on the wire.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            FacetError::Fault { code, .. } => code.clone(),
            FacetError::Decode { .. }
            | FacetError::Json { .. }
            | FacetError::FrameTooLarge { .. } => FaultCode::DecodeError,
            FacetError::Timeout(_) => FaultCode::HandlerTimeout,
            _ => FaultCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FacetError::fault(FaultCode::UnknownOperation, "Unknown operation: bogus");
        assert_eq!(
            err.to_string(),
            "unknown-operation: Unknown operation: bogus"
        );
    }

    #[test]
    fn test_fault_codes() {
        assert_eq!(
            FacetError::Decode {
                message: "bad".into()
            }
            .fault_code(),
            FaultCode::DecodeError
        );
        assert_eq!(
            FacetError::Other("boom".into()).fault_code(),
            FaultCode::InternalError
        );
        assert_eq!(
            FacetError::fault(FaultCode::Other("teapot".into()), "x").fault_code(),
            FaultCode::Other("teapot".into())
        );
    }

    #[test]
    fn test_timeout_maps_to_handler_timeout() {
        assert_eq!(
            FacetError::Timeout(Duration::from_secs(5)).fault_code(),
            FaultCode::HandlerTimeout
        );
        assert_eq!(
            FacetError::FrameTooLarge { size: 10, max: 5 }.fault_code(),
            FaultCode::DecodeError
        );
    }
}
