//! Error types for the fibridge-proto crate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("Protocol violation: {0}")]
    Violation(String),
}

impl CodecError {
    /// Violations are fatal to the connection; the peer misbehaved.
    ///
    /// Everything else is a transport problem.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CodecError::Oversized { .. } | CodecError::Malformed(_) | CodecError::Violation(_)
        )
    }
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        CodecError::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
