/*!
 * fibridge - serve host-resident files through a public relay
 *
 * A host keeps one outbound control connection to a relay; HTTP clients
 * fetch `/{session}/{path}` from the relay, range requests included, and
 * the relay forwards each request to the host that owns the file.
 *
 * - `fibridge-proto`: control-connection messages and framing
 * - `fibridge-host`: path registry, range slicer, reconnecting session
 * - `fibridge-relay`: HTTP server and request multiplexer
 *
 * This crate adds the configuration file, logging setup and the two
 * command-line modes.
 */

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;

pub use config::{BridgeConfig, HostSection, LogLevel, LoggingSection, RelaySection};
pub use error::{BridgeError, Result};

pub use fibridge_host as host;
pub use fibridge_proto as proto;
pub use fibridge_relay as relay;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
