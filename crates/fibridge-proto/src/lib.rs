//! Fibridge Proto: the control-connection protocol between a host session
//! and the relay.
//!
//! The relay forwards HTTP range requests to the host as [`Message::RequestRange`];
//! the host answers with one [`Message::ResponseHeader`] followed by a stream
//! of [`Message::Chunk`]s, never more chunks than the relay has granted with
//! the request and later [`Message::Credit`]s. Many requests share the one connection and their
//! messages interleave freely, but within one request the order is total.
//!
//! ```text
//!  host                                   relay
//!   │ ── Handshake ───────────────────────▶ │
//!   │ ◀────────────────────────── Welcome ─ │
//!   │ ── Register /genome.bam ────────────▶ │
//!   │ ◀──────────── RequestRange #0 0-999 ─ │
//!   │ ── ResponseHeader #0 206 ───────────▶ │
//!   │ ── Chunk #0 seq 0 ──────────────────▶ │
//!   │ ◀──────────────────── Credit #0 +1 ─ │
//!   │ ── Chunk #0 seq 1 final ────────────▶ │
//! ```

pub mod error;
pub mod framing;
pub mod message;
pub mod tracker;

pub use error::{CodecError, Result};
pub use framing::{
    decode_frame, encode_frame, framed, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN,
};
pub use message::{
    ByteRange, ErrorCode, Message, RequestId, ResponseStatus, ResumeTicket, PROTOCOL_VERSION,
};
pub use tracker::{StreamState, StreamTracker};
