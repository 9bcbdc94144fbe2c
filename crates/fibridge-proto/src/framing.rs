//! Length-prefixed framing over an async byte stream.
//!
//! Each frame is a 4-byte little-endian payload length followed by one
//! bincode-encoded [`Message`]. Message boundaries therefore survive any
//! segmentation of the underlying stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

use crate::error::{CodecError, Result};
use crate::message::Message;

/// Size of the length prefix in bytes.
pub const FRAME_LEN_PREFIX_SIZE: usize = 4;

/// Default upper bound for a single frame payload (8 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const READ_RESERVE: usize = 64 * 1024;

/// Encode a message into a complete frame (prefix included).
pub fn encode_frame(msg: &Message, max_frame_len: usize) -> Result<Bytes> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > max_frame_len {
        return Err(CodecError::Oversized {
            len: payload.len(),
            max: max_frame_len,
        });
    }

    let mut frame = BytesMut::with_capacity(FRAME_LEN_PREFIX_SIZE + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Try to take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Consumed bytes are removed
/// from `buf`; a partial frame is left untouched.
pub fn decode_frame(buf: &mut BytesMut, max_frame_len: usize) -> Result<Option<Message>> {
    if buf.len() < FRAME_LEN_PREFIX_SIZE {
        return Ok(None);
    }

    let frame_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if frame_len > max_frame_len {
        return Err(CodecError::Oversized {
            len: frame_len,
            max: max_frame_len,
        });
    }

    let frame_end = FRAME_LEN_PREFIX_SIZE + frame_len;
    if buf.len() < frame_end {
        buf.reserve(frame_end - buf.len());
        return Ok(None);
    }

    buf.advance(FRAME_LEN_PREFIX_SIZE);
    let payload = buf.split_to(frame_len);
    let msg: Message = bincode::deserialize(&payload)?;
    trace!("<-- {} ({} bytes)", msg.kind(), frame_len);
    Ok(Some(msg))
}

/// Reading half of a framed control connection.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_len: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_RESERVE),
            max_frame_len,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary.
    /// Cancel-safe: the only await point is the buffered read, so a dropped
    /// call loses no data and the next call resumes where it left off.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = decode_frame(&mut self.buf, self.max_frame_len)? {
                return Ok(Some(msg));
            }

            if self.buf.capacity() - self.buf.len() < READ_RESERVE {
                self.buf.reserve(READ_RESERVE);
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::Truncated {
                    buffered: self.buf.len(),
                });
            }
        }
    }
}

/// Writing half of a framed control connection.
pub struct FrameWriter<W> {
    inner: W,
    max_frame_len: usize,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    /// Write one message and flush it.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg, self.max_frame_len)?;
        trace!("--> {} ({} bytes)", msg.kind(), frame.len() - FRAME_LEN_PREFIX_SIZE);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a duplex stream into a framed reader and writer.
pub fn framed<S>(stream: S, max_frame_len: usize) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FrameReader::new(read_half, max_frame_len),
        FrameWriter::new(write_half, max_frame_len),
    )
}
