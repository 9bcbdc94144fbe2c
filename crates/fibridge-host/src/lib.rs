//! Fibridge Host: serve local data through a relay without opening a port.
//!
//! # Overview
//!
//! The host dials out to a relay and keeps one control connection open. HTTP
//! clients fetch `/{session_id}/{path}` from the relay; the relay forwards each
//! request down the control connection and the host answers with the bytes.
//!
//! - **Path Registry**: virtual paths to [`DataSource`]s, traversal-proof
//! - **Range Slicer**: lazy chunked reads of any byte range in bounded memory
//! - **Session**: the control connection, with reconnect and registry replay
//!
//! # Example
//!
//! ```no_run
//! use fibridge_host::{FileSource, Session, SessionConfig, TcpConnector};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::start(SessionConfig::default(), TcpConnector).await?;
//! let source = FileSource::open("genome.bam").await?.into_handle();
//! let hosted = session.handle().host_file("/genome.bam", source, None).await?;
//! println!("serving at {}", hosted.url);
//! session.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod error;
pub mod registry;
pub mod session;
pub mod slicer;
pub mod source;
pub mod url;

pub use backoff::{Backoff, BackoffConfig};
pub use error::{RegistryError, Result, SessionError, SliceError};
pub use registry::{normalize_path, HostedEntry, PathRegistry};
pub use session::{
    ConnectionState, Connector, HostedFile, Session, SessionConfig, SessionHandle, TcpConnector,
};
pub use slicer::{
    resolve_range, ChunkStream, RangeSlicer, Span, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};
pub use source::{DataSource, FileSource, MemorySource, SourceHandle};
