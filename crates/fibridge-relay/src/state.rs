//! Relay configuration and the state shared by the HTTP and control sides.

use fibridge_proto::DEFAULT_MAX_FRAME_LEN;
use std::sync::Arc;
use std::time::Duration;

use crate::id::{IdGenerator, IdGeneratorKind, ResumeKey};
use crate::sessions::SessionTable;
use crate::stats::RelayStats;

/// Configuration for a relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address HTTP clients connect to
    pub http_addr: String,

    /// Address hosts open control connections to
    pub control_addr: String,

    /// Time a host has to answer a forwarded request with a header
    pub response_timeout: Duration,

    /// Time a new control connection has to send its Handshake
    pub handshake_timeout: Duration,

    /// Largest frame accepted from a host
    pub max_frame_len: usize,

    /// Chunks a host may send ahead of the client, per response
    pub body_buffer_chunks: usize,

    pub id_generator: IdGeneratorKind,

    /// Key material for resume tokens. Without it tokens are only valid
    /// until the relay restarts.
    pub resume_secret: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            control_addr: "0.0.0.0:8081".to_string(),
            response_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            body_buffer_chunks: 16,
            id_generator: IdGeneratorKind::default(),
            resume_secret: None,
        }
    }
}

pub struct RelayState {
    pub config: RelayConfig,
    pub sessions: SessionTable,
    pub stats: Arc<RelayStats>,
    pub ids: Arc<dyn IdGenerator>,
    pub resume_key: ResumeKey,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            ids: config.id_generator.build(),
            resume_key: match &config.resume_secret {
                Some(secret) => ResumeKey::from_secret(secret),
                None => ResumeKey::random(),
            },
            config,
            sessions: SessionTable::new(),
            stats: Arc::new(RelayStats::default()),
        }
    }
}
