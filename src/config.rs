/*!
 * Configuration types for fibridge
 */

use fibridge_host::{BackoffConfig, SessionConfig, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use fibridge_proto::DEFAULT_MAX_FRAME_LEN;
use fibridge_relay::{IdGeneratorKind, RelayConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Frame overhead a chunk must leave room for (header fields plus length prefix).
const CHUNK_FRAME_OVERHEAD: usize = 64;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub relay: RelaySection,
    pub host: HostSection,
    pub logging: LoggingSection,
}

/// `[relay]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySection {
    /// Address HTTP clients connect to
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Address hosts open control connections to
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    /// Time a host has to answer a forwarded request
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Time a new host connection has to complete its handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Largest control frame accepted, in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Chunks a host may stream ahead of each HTTP client
    #[serde(default = "default_body_buffer_chunks")]
    pub body_buffer_chunks: usize,

    /// Session id style: `short` or `uuid`
    #[serde(default)]
    pub id_generator: IdGeneratorKind,

    /// Secret behind resume tokens; set it to keep sessions resumable
    /// across relay restarts
    #[serde(default)]
    pub resume_secret: Option<String>,
}

/// `[host]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSection {
    /// Relay host name, used both to connect and in hosted URLs
    #[serde(default = "default_relay_address")]
    pub relay_address: String,

    /// Public HTTP port of the relay
    #[serde(default = "default_port")]
    pub port: u16,

    /// Control port of the relay
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Generate `https` URLs
    #[serde(default)]
    pub secure: bool,

    /// Bytes per chunk sent to the relay
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Reconnect attempts before the session gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomize reconnect delays
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// `[logging]` table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,

    /// Log file path (None = stderr)
    pub file: Option<PathBuf>,

    /// Shorthand for `level = "debug"`
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            control_addr: default_control_addr(),
            response_timeout_ms: default_response_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            body_buffer_chunks: default_body_buffer_chunks(),
            id_generator: IdGeneratorKind::default(),
            resume_secret: None,
        }
    }
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            relay_address: default_relay_address(),
            port: default_port(),
            control_port: default_control_port(),
            secure: false,
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_control_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_body_buffer_chunks() -> usize {
    16
}

fn default_relay_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_control_port() -> u16 {
    8081
}

fn default_chunk_size() -> usize {
    256 * 1024 // 256 KiB
}

fn default_max_retries() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BridgeConfig = toml::from_str(&contents)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject settings no session or relay could run with.
    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;
        if relay.response_timeout_ms == 0 {
            return Err(config_error("relay.response_timeout_ms must be positive"));
        }
        if relay.handshake_timeout_ms == 0 {
            return Err(config_error("relay.handshake_timeout_ms must be positive"));
        }
        if relay.body_buffer_chunks == 0 || relay.body_buffer_chunks > u32::MAX as usize {
            return Err(config_error("relay.body_buffer_chunks must be between 1 and 2^32-1"));
        }
        if relay.resume_secret.as_deref().is_some_and(str::is_empty) {
            return Err(config_error("relay.resume_secret must not be empty"));
        }
        if relay.max_frame_len < MIN_CHUNK_SIZE + CHUNK_FRAME_OVERHEAD {
            return Err(BridgeError::Config(format!(
                "relay.max_frame_len must be at least {} bytes",
                MIN_CHUNK_SIZE + CHUNK_FRAME_OVERHEAD
            )));
        }

        let host = &self.host;
        if host.chunk_size == 0 {
            return Err(config_error("host.chunk_size must be positive"));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&host.chunk_size) {
            return Err(BridgeError::Config(format!(
                "host.chunk_size must be between {} and {} bytes",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if host.chunk_size + CHUNK_FRAME_OVERHEAD > relay.max_frame_len {
            return Err(config_error(
                "host.chunk_size does not fit in one relay.max_frame_len frame",
            ));
        }
        if host.initial_backoff_ms == 0 {
            return Err(config_error("host.initial_backoff_ms must be positive"));
        }
        if host.initial_backoff_ms > host.max_backoff_ms {
            return Err(config_error(
                "host.initial_backoff_ms must not exceed host.max_backoff_ms",
            ));
        }
        if !(host.backoff_multiplier.is_finite() && host.backoff_multiplier >= 1.0) {
            return Err(config_error("host.backoff_multiplier must be at least 1.0"));
        }
        Ok(())
    }

    pub fn relay_config(&self) -> RelayConfig {
        let relay = &self.relay;
        RelayConfig {
            http_addr: relay.http_addr.clone(),
            control_addr: relay.control_addr.clone(),
            response_timeout: Duration::from_millis(relay.response_timeout_ms),
            handshake_timeout: Duration::from_millis(relay.handshake_timeout_ms),
            max_frame_len: relay.max_frame_len,
            body_buffer_chunks: relay.body_buffer_chunks,
            id_generator: relay.id_generator,
            resume_secret: relay.resume_secret.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let host = &self.host;
        SessionConfig {
            relay_address: host.relay_address.clone(),
            port: host.port,
            control_port: host.control_port,
            secure: host.secure,
            chunk_size: host.chunk_size,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(host.initial_backoff_ms),
                max_delay: Duration::from_millis(host.max_backoff_ms),
                multiplier: host.backoff_multiplier,
                max_retries: host.max_retries,
                jitter: host.jitter,
            },
            ..SessionConfig::default()
        }
    }
}

fn config_error(message: &str) -> BridgeError {
    BridgeError::Config(message.to_string())
}
