//! Message types carried over the control connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier the relay assigns to each forwarded HTTP request.
///
/// Unique for the lifetime of one control connection.
pub type RequestId = u64;

/// Current protocol revision, sent in [`Message::Handshake`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Byte range requested by an HTTP client, before it is resolved against the
/// size of the hosted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteRange {
    /// No `Range` header: the whole file.
    Full,
    /// `bytes=start-`
    From { start: u64 },
    /// `bytes=start-end`, end inclusive.
    Bounded { start: u64, end: u64 },
    /// `bytes=-length`: the last `length` bytes.
    Suffix { length: u64 },
}

impl ByteRange {
    /// Whether the client asked for a partial response.
    pub fn is_partial(&self) -> bool {
        !matches!(self, ByteRange::Full)
    }
}

/// Outcome reported by the host in a [`Message::ResponseHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    PartialContent,
    NotFound,
    RangeNotSatisfiable,
    Error,
}

impl ResponseStatus {
    /// HTTP status code the relay answers with.
    pub fn http_code(&self) -> u16 {
        match self {
            ResponseStatus::Ok => 200,
            ResponseStatus::PartialContent => 206,
            ResponseStatus::NotFound => 404,
            ResponseStatus::RangeNotSatisfiable => 416,
            ResponseStatus::Error => 502,
        }
    }

    /// Statuses that are followed by a chunk stream.
    pub fn has_body(&self) -> bool {
        matches!(self, ResponseStatus::Ok | ResponseStatus::PartialContent)
    }
}

/// Proof that a reconnecting host owns the session id it asks for.
///
/// The token is the one the relay handed out in [`Message::Welcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeTicket {
    pub session_id: String,
    pub token: String,
}

/// Connection-level fault codes for [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ProtocolViolation,
    UnsupportedVersion,
    HandshakeRejected,
    /// The host could not read a source mid-stream; fails one request.
    ReadFailed,
    Shutdown,
    Internal,
}

/// A single control-connection message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// host → relay, first frame on every connection.
    Handshake {
        protocol_version: u32,
        resume: Option<ResumeTicket>,
    },
    /// relay → host, completes the handshake. `resume_token` lets the host
    /// claim the same id after a reconnect.
    Welcome {
        session_id: String,
        resume_token: String,
    },
    /// host → relay: announce a hostable path.
    Register {
        virtual_path: String,
        media_type: String,
        size_bytes: u64,
    },
    /// host → relay: withdraw a path.
    Unregister { virtual_path: String },
    /// relay → host: an HTTP client asked for this range. The host may send
    /// `credit` chunks before it has to wait for a [`Message::Credit`].
    RequestRange {
        request_id: RequestId,
        virtual_path: String,
        range: ByteRange,
        credit: u32,
    },
    /// relay → host: the client consumed `chunks` more chunks of a request.
    Credit { request_id: RequestId, chunks: u32 },
    /// host → relay: precedes the chunk stream of a request.
    ResponseHeader {
        request_id: RequestId,
        status: ResponseStatus,
        content_length: u64,
        range_start: u64,
        total_size: u64,
    },
    /// host → relay: streamed body data.
    Chunk {
        request_id: RequestId,
        sequence: u64,
        bytes: Bytes,
        is_final: bool,
    },
    /// relay → host: the HTTP client went away.
    Cancel { request_id: RequestId },
    /// Either direction. Without a request id the fault concerns the whole
    /// connection; with one it aborts only that request's stream.
    Error {
        code: ErrorCode,
        message: String,
        request_id: Option<RequestId>,
    },
}

impl Message {
    /// Short name used in log lines and violation reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "Handshake",
            Message::Welcome { .. } => "Welcome",
            Message::Register { .. } => "Register",
            Message::Unregister { .. } => "Unregister",
            Message::RequestRange { .. } => "RequestRange",
            Message::ResponseHeader { .. } => "ResponseHeader",
            Message::Chunk { .. } => "Chunk",
            Message::Credit { .. } => "Credit",
            Message::Cancel { .. } => "Cancel",
            Message::Error { .. } => "Error",
        }
    }

    /// Request the message belongs to, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Message::RequestRange { request_id, .. }
            | Message::ResponseHeader { request_id, .. }
            | Message::Chunk { request_id, .. }
            | Message::Credit { request_id, .. }
            | Message::Cancel { request_id } => Some(*request_id),
            Message::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Whether a host may legally send this message.
    pub fn is_host_originated(&self) -> bool {
        matches!(
            self,
            Message::Handshake { .. }
                | Message::Register { .. }
                | Message::Unregister { .. }
                | Message::ResponseHeader { .. }
                | Message::Chunk { .. }
                | Message::Error { .. }
        )
    }

    /// Whether a relay may legally send this message.
    pub fn is_relay_originated(&self) -> bool {
        matches!(
            self,
            Message::Welcome { .. }
                | Message::RequestRange { .. }
                | Message::Credit { .. }
                | Message::Cancel { .. }
                | Message::Error { .. }
        )
    }
}
