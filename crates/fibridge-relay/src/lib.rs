//! Fibridge Relay: the publicly reachable half of the hosting bridge.
//!
//! # Overview
//!
//! Hosts dial the relay's control listener and stay connected. HTTP clients
//! fetch `/{session_id}/{path}`; the relay turns each request into a
//! `RequestRange` on that session's control connection and streams the
//! host's answer back as the response body.
//!
//! ```text
//!  HTTP client ──GET──▶ ┌────────────┐ ◀══ control connection ══ host
//!                       │   relay    │
//!  HTTP client ◀─206─── │ multiplexer│ ══ RequestRange ═════════▶
//!                       └────────────┘ ◀═ ResponseHeader, Chunk… ═
//! ```
//!
//! Many HTTP requests share one control connection; each gets a fresh
//! request id and its own body channel, which the host may only fill as far
//! as the relay has granted credit.

pub mod control;
pub mod error;
pub mod http;
pub mod id;
pub mod link;
pub mod range;
pub mod server;
pub mod sessions;
pub mod state;
pub mod stats;

pub use error::{RelayError, Result};
pub use id::{IdGenerator, IdGeneratorKind, ResumeKey, ShortIdGenerator, UuidGenerator};
pub use link::{CatalogEntry, ControlLink, PendingRequest, ResponseBody, ResponseHead};
pub use range::RangeRequest;
pub use server::RelayServer;
pub use sessions::{SessionSummary, SessionTable};
pub use state::{RelayConfig, RelayState};
pub use stats::{RelayStats, StatsSnapshot, TransferStats};
