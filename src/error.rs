/*!
 * Error types for fibridge
 */

use fibridge_host::{RegistryError, SessionError};
use fibridge_relay::RelayError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot host {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(_)
            | BridgeError::ConfigFile { .. }
            | BridgeError::Source { .. }
            | BridgeError::Registry(_) => EXIT_FATAL,
            BridgeError::Session(e) => match e {
                SessionError::ReconnectExhausted { .. }
                | SessionError::HandshakeFailed(_)
                | SessionError::InvalidAddress(_)
                | SessionError::Registry(_) => EXIT_FATAL,
                _ => EXIT_PARTIAL,
            },
            BridgeError::Relay(RelayError::Bind { .. }) => EXIT_FATAL,
            BridgeError::Relay(_) | BridgeError::Io(_) => EXIT_PARTIAL,
        }
    }
}
