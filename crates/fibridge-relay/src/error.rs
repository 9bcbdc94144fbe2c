//! Error types for the fibridge-relay crate

use axum::http::StatusCode;
use fibridge_proto::{CodecError, ErrorCode};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Codec(#[from] CodecError),

    #[error("No handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Expected Handshake, got {0}")]
    UnexpectedHandshake(&'static str),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Host reported {code:?}: {message}")]
    HostError { code: ErrorCode, message: String },

    #[error("Host failed to read the source: {0}")]
    HostReadFailed(String),

    #[error("Control connection closed")]
    LinkClosed,

    #[error("Host did not answer in time")]
    UpstreamTimeout,
}

impl RelayError {
    /// Status an HTTP client sees when its request fails with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
