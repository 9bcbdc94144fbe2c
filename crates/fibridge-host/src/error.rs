//! Error types for the fibridge-host crate

use fibridge_proto::CodecError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid virtual path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Path {0} is already hosted from a different source")]
    PathConflict(String),

    #[error("Path not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum SliceError {
    #[error("Range start {start} is beyond the {size} byte source")]
    RangeNotSatisfiable { start: u64, size: u64 },

    #[error("Read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("Control connection lost: {0}")]
    TransportLost(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Gave up reconnecting after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Relay address does not form a valid URL: {0}")]
    InvalidAddress(String),

    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Errors that end the connection but may be recovered by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::TransportLost(_)
                | SessionError::ProtocolViolation(_)
                | SessionError::HandshakeFailed(_)
        )
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        if err.is_protocol_violation() {
            SessionError::ProtocolViolation(err.to_string())
        } else {
            SessionError::TransportLost(err.to_string())
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::TransportLost(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
