//! Per-request ordering checks for the response side of the protocol.
//!
//! A request stream must see exactly one `ResponseHeader`, then (only for
//! statuses with a body) chunks numbered 0, 1, 2, … with the last one marked
//! final, and the chunk bytes must add up to the announced content length.

use crate::error::{CodecError, Result};
use crate::message::{RequestId, ResponseStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingHeader,
    Streaming { next_sequence: u64 },
    Finished,
}

#[derive(Debug, Clone)]
pub struct StreamTracker {
    request_id: RequestId,
    state: StreamState,
    content_length: u64,
    bytes_received: u64,
    chunks_received: u64,
}

impl StreamTracker {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            state: StreamState::AwaitingHeader,
            content_length: 0,
            bytes_received: 0,
            chunks_received: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks_received
    }

    /// Record the response header.
    pub fn on_header(&mut self, status: ResponseStatus, content_length: u64) -> Result<()> {
        if self.state != StreamState::AwaitingHeader {
            return Err(self.violation("duplicate ResponseHeader"));
        }

        self.content_length = content_length;
        self.state = if status.has_body() {
            StreamState::Streaming { next_sequence: 0 }
        } else {
            StreamState::Finished
        };
        Ok(())
    }

    /// Record a chunk. Returns `true` when it completed the stream.
    pub fn on_chunk(&mut self, sequence: u64, len: usize, is_final: bool) -> Result<bool> {
        let expected = match self.state {
            StreamState::AwaitingHeader => {
                return Err(self.violation("Chunk before ResponseHeader"));
            }
            StreamState::Finished => {
                return Err(self.violation("Chunk after final chunk"));
            }
            StreamState::Streaming { next_sequence } => next_sequence,
        };

        if sequence != expected {
            return Err(self.violation(&format!(
                "chunk sequence {} where {} was expected",
                sequence, expected
            )));
        }

        self.bytes_received += len as u64;
        self.chunks_received += 1;

        if self.bytes_received > self.content_length {
            return Err(self.violation(&format!(
                "{} bytes received for content length {}",
                self.bytes_received, self.content_length
            )));
        }

        if is_final {
            if self.bytes_received != self.content_length {
                return Err(self.violation(&format!(
                    "final chunk after {} of {} bytes",
                    self.bytes_received, self.content_length
                )));
            }
            self.state = StreamState::Finished;
            return Ok(true);
        }

        self.state = StreamState::Streaming {
            next_sequence: expected + 1,
        };
        Ok(false)
    }

    fn violation(&self, what: &str) -> CodecError {
        CodecError::Violation(format!("request {}: {}", self.request_id, what))
    }
}
