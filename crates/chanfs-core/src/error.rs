//! Error types for the chanfs protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::State;

/// Relative path validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path token {0:?} contains the separator character")]
    ContainsSeparator(String),

    #[error("path {0:?} contains an empty token")]
    EmptyToken(String),

    #[error("path {0:?} must be relative (no leading separator)")]
    LeadingSeparator(String),

    #[error("path contains null byte")]
    NullByte,

    #[error("path token {0:?} is not allowed")]
    SpecialToken(String),

    #[error("path token {0:?} contains a platform path separator")]
    PlatformSeparator(String),

    #[error("path too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },
}

/// Control-plane protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("control frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unexpected state {actual} (expected {expected})")]
    UnexpectedState { expected: State, actual: State },

    #[error("size mismatch: declared {declared} bytes, transferred {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Wire error codes carried in the `Error` payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed relative path or a request the server refuses
    Validation,
    /// Channel or file absent
    NotFound,
    /// Disk read/write/open failure
    Io,
    /// Malformed control document or size mismatch
    Protocol,
    /// Network failure mid-transfer
    Connection,
}

impl From<&ProtocolError> for ErrorCode {
    fn from(_: &ProtocolError) -> Self {
        ErrorCode::Protocol
    }
}

impl From<&PathError> for ErrorCode {
    fn from(_: &PathError) -> Self {
        ErrorCode::Validation
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Validation => "validation",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Io => "io",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Connection => "connection",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotFound).unwrap(),
            "\"not_found\""
        );
        assert_eq!(ErrorCode::NotFound.to_string(), "not_found");
    }

    #[test]
    fn test_json_error_is_protocol_error() {
        let err: ProtocolError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
        assert_eq!(ErrorCode::from(&err), ErrorCode::Protocol);
    }
}
