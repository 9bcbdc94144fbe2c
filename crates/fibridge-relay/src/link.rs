//! Request multiplexing over one host's control connection.
//!
//! A [`ControlLink`] owns the in-flight table for its connection. HTTP
//! handlers insert a slot and send `RequestRange`; the connection's reader
//! task routes each `ResponseHeader` and `Chunk` to the matching slot, after
//! checking it with a [`StreamTracker`]. Slots leave the table when their
//! stream completes, when the client goes away (sending `Cancel`), or when
//! the connection closes (failing every waiter).
//!
//! Flow control is per request. `RequestRange` grants the host as many
//! chunks as the body channel holds, and the response body returns one
//! `Credit` for every chunk the client takes. The reader never waits on a
//! body channel: a host that overruns its credit loses that one request.

use bytes::Bytes;
use fibridge_proto::{
    ByteRange, CodecError, ErrorCode, Message, RequestId, ResponseStatus, StreamTracker,
};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::stats::{RelayStats, TransferStats};

/// What the host announced about one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub media_type: String,
    pub size_bytes: u64,
}

/// Parsed `ResponseHeader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: ResponseStatus,
    pub content_length: u64,
    pub range_start: u64,
    pub total_size: u64,
}

type HeaderSender = oneshot::Sender<Result<ResponseHead>>;
type BodySender = mpsc::Sender<io::Result<Bytes>>;

struct PendingSlot {
    /// Taken when the header is delivered.
    header: Option<HeaderSender>,
    body: BodySender,
    tracker: StreamTracker,
}

pub struct ControlLink {
    session_id: String,
    peer: SocketAddr,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<RequestId, PendingSlot>>,
    next_request_id: AtomicU64,
    catalog: RwLock<BTreeMap<String, CatalogEntry>>,
    body_buffer: usize,
    closed: CancellationToken,
}

impl std::fmt::Debug for ControlLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLink")
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ControlLink {
    pub fn new(
        session_id: String,
        peer: SocketAddr,
        outbound: mpsc::Sender<Message>,
        body_buffer: usize,
    ) -> Self {
        Self {
            session_id,
            peer,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            catalog: RwLock::new(BTreeMap::new()),
            body_buffer: body_buffer.max(1),
            closed: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn catalog(&self) -> BTreeMap<String, CatalogEntry> {
        self.catalog.read().clone()
    }

    pub fn media_type(&self, virtual_path: &str) -> Option<String> {
        self.catalog
            .read()
            .get(virtual_path)
            .map(|entry| entry.media_type.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Forward a request to the host.
    ///
    /// The returned [`PendingRequest`] cancels the request on the host when
    /// dropped before its stream completes.
    pub async fn open_request(
        self: &Arc<Self>,
        virtual_path: &str,
        range: ByteRange,
    ) -> Result<PendingRequest> {
        if self.is_closed() {
            return Err(RelayError::LinkClosed);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let credit = u32::try_from(self.body_buffer).unwrap_or(u32::MAX);
        let (header_tx, header_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(self.body_buffer);

        self.pending.lock().insert(
            request_id,
            PendingSlot {
                header: Some(header_tx),
                body: body_tx,
                tracker: StreamTracker::new(request_id),
            },
        );
        let request = PendingRequest {
            link: self.clone(),
            request_id,
            header: header_rx,
            body: body_rx,
        };

        // fail_all may have drained the table just before our insert.
        if self.is_closed() {
            self.pending.lock().remove(&request_id);
            return Err(RelayError::LinkClosed);
        }

        debug!(
            "Session {}: request {} {} {:?}",
            self.session_id, request_id, virtual_path, range
        );
        self.outbound
            .send(Message::RequestRange {
                request_id,
                virtual_path: virtual_path.to_string(),
                range,
                credit,
            })
            .await
            .map_err(|_| RelayError::LinkClosed)?;

        Ok(request)
    }

    /// Drop a request and tell the host to stop streaming it.
    ///
    /// No-op for requests that already completed.
    pub fn cancel(&self, request_id: RequestId) {
        if self.pending.lock().remove(&request_id).is_none() {
            return;
        }
        debug!("Session {}: cancelling request {}", self.session_id, request_id);
        self.post(Message::Cancel { request_id });
    }

    /// Queue a message without waiting, spilling to a task when the queue is full.
    fn post(&self, message: Message) {
        match self.outbound.try_send(message) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(message)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    runtime.spawn(async move {
                        let _ = outbound.send(message).await;
                    });
                }
            }
        }
    }

    /// Report a connection-level fault to the host.
    pub fn notify_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.post(Message::Error {
            code,
            message: message.into(),
            request_id: None,
        });
    }

    /// Close the link and fail every in-flight request.
    ///
    /// Requests still waiting for a header get `LinkClosed` (502); streaming
    /// ones see their body end in an error.
    pub fn fail_all(&self, reason: &str) {
        self.closed.cancel();

        let slots: Vec<_> = self.pending.lock().drain().collect();
        if !slots.is_empty() {
            warn!(
                "Session {}: failing {} in-flight requests: {}",
                self.session_id,
                slots.len(),
                reason
            );
        }

        for (_, mut slot) in slots {
            match slot.header.take() {
                Some(header) => {
                    let _ = header.send(Err(RelayError::LinkClosed));
                }
                None => {
                    let _ = slot.body.try_send(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        reason.to_string(),
                    )));
                }
            }
        }
    }

    /// Close without failing requests yet; the reader task does that on exit.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Route one message from the host. Never waits.
    pub fn deliver(&self, message: Message) -> Result<()> {
        match message {
            Message::Register {
                virtual_path,
                media_type,
                size_bytes,
            } => {
                info!(
                    "Session {}: hosting {} ({} bytes, {})",
                    self.session_id, virtual_path, size_bytes, media_type
                );
                self.catalog.write().insert(
                    virtual_path,
                    CatalogEntry {
                        media_type,
                        size_bytes,
                    },
                );
            }
            Message::Unregister { virtual_path } => {
                info!("Session {}: stopped hosting {}", self.session_id, virtual_path);
                self.catalog.write().remove(&virtual_path);
            }
            Message::ResponseHeader {
                request_id,
                status,
                content_length,
                range_start,
                total_size,
            } => self.deliver_header(
                request_id,
                ResponseHead {
                    status,
                    content_length,
                    range_start,
                    total_size,
                },
            )?,
            Message::Chunk {
                request_id,
                sequence,
                bytes,
                is_final,
            } => self.deliver_chunk(request_id, sequence, bytes, is_final)?,
            Message::Error {
                code,
                message,
                request_id: Some(request_id),
            } => self.deliver_request_error(request_id, code, message),
            Message::Error {
                code,
                message,
                request_id: None,
            } => return Err(RelayError::HostError { code, message }),
            other => {
                return Err(CodecError::Violation(format!(
                    "host sent relay-only message {}",
                    other.kind()
                ))
                .into())
            }
        }
        Ok(())
    }

    fn deliver_header(&self, request_id: RequestId, head: ResponseHead) -> Result<()> {
        let mut pending = self.pending.lock();
        let Some(slot) = pending.get_mut(&request_id) else {
            debug!("Discarding header for finished request {}", request_id);
            return Ok(());
        };

        slot.tracker.on_header(head.status, head.content_length)?;

        let delivered = match slot.header.take() {
            Some(header) => header.send(Ok(head)).is_ok(),
            None => false,
        };

        if !delivered {
            pending.remove(&request_id);
            drop(pending);
            debug!("Request {} abandoned before its header arrived", request_id);
            self.post(Message::Cancel { request_id });
        } else if !head.status.has_body() {
            pending.remove(&request_id);
        }
        Ok(())
    }

    fn deliver_chunk(
        &self,
        request_id: RequestId,
        sequence: u64,
        bytes: Bytes,
        is_final: bool,
    ) -> Result<()> {
        let mut pending = self.pending.lock();
        let Some(slot) = pending.get_mut(&request_id) else {
            debug!("Discarding chunk {} of cancelled request {}", sequence, request_id);
            return Ok(());
        };

        let done = slot.tracker.on_chunk(sequence, bytes.len(), is_final)?;
        let overrun = match slot.body.try_send(Ok(bytes)) {
            Ok(()) if done => {
                pending.remove(&request_id);
                return Ok(());
            }
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        };

        // Dropping the slot ends the body short, which the client sees as an error.
        pending.remove(&request_id);
        drop(pending);
        if overrun {
            warn!(
                "Session {}: request {} sent past its credit, cancelling it",
                self.session_id, request_id
            );
        } else {
            debug!("Request {} lost its client mid-stream", request_id);
        }
        if !done {
            self.post(Message::Cancel { request_id });
        }
        Ok(())
    }

    fn deliver_request_error(&self, request_id: RequestId, code: ErrorCode, message: String) {
        let Some(mut slot) = self.pending.lock().remove(&request_id) else {
            return;
        };
        warn!(
            "Session {}: host failed request {} ({:?}): {}",
            self.session_id, request_id, code, message
        );

        match slot.header.take() {
            Some(header) => {
                let _ = header.send(Err(RelayError::HostReadFailed(message)));
            }
            // A full channel still ends short once the slot is dropped.
            None => {
                let _ = slot.body.try_send(Err(io::Error::new(io::ErrorKind::Other, message)));
            }
        }
    }
}

/// A request forwarded to the host and not yet finished.
pub struct PendingRequest {
    link: Arc<ControlLink>,
    request_id: RequestId,
    header: oneshot::Receiver<Result<ResponseHead>>,
    body: mpsc::Receiver<io::Result<Bytes>>,
}

impl PendingRequest {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the host's `ResponseHeader`.
    pub async fn header(&mut self) -> Result<ResponseHead> {
        (&mut self.header)
            .await
            .map_err(|_| RelayError::LinkClosed)?
    }

    /// Stream the body of a response whose header said `content_length`.
    pub fn into_body(self, content_length: u64, stats: Arc<RelayStats>) -> ResponseBody {
        ResponseBody {
            request: self,
            expected: content_length,
            transfer: TransferStats::default(),
            stats,
            started: Instant::now(),
            outcome: None,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.link.cancel(self.request_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
}

/// HTTP response body fed by a request's chunk stream.
///
/// Yields an error if the stream ends short of its content length, so the
/// client never mistakes a truncated body for a complete one. Dropping it
/// early cancels the request on the host.
pub struct ResponseBody {
    request: PendingRequest,
    expected: u64,
    transfer: TransferStats,
    stats: Arc<RelayStats>,
    started: Instant,
    outcome: Option<Outcome>,
}

impl ResponseBody {
    fn finish(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
        match outcome {
            Outcome::Completed => {
                debug!(
                    "Request {} complete: {} chunks, {} bytes in {:?}",
                    self.request.request_id,
                    self.transfer.chunks,
                    self.transfer.bytes,
                    self.started.elapsed()
                );
                self.stats.request_completed(self.transfer);
            }
            Outcome::Failed => {
                warn!(
                    "Request {} failed after {} of {} bytes",
                    self.request.request_id, self.transfer.bytes, self.expected
                );
                self.stats.request_failed(self.transfer);
            }
        }
    }
}

impl Stream for ResponseBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.outcome.is_some() {
            return Poll::Ready(None);
        }

        match ready!(this.request.body.poll_recv(cx)) {
            Some(Ok(bytes)) => {
                this.transfer.record(bytes.len());
                if this.transfer.bytes >= this.expected {
                    this.finish(Outcome::Completed);
                } else {
                    this.request.link.post(Message::Credit {
                        request_id: this.request.request_id,
                        chunks: 1,
                    });
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(Err(e)) => {
                this.finish(Outcome::Failed);
                Poll::Ready(Some(Err(e)))
            }
            None if this.transfer.bytes >= this.expected => {
                this.finish(Outcome::Completed);
                Poll::Ready(None)
            }
            None => {
                this.finish(Outcome::Failed);
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "host stream ended early",
                ))))
            }
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            debug!(
                "Request {} cancelled by the client after {} bytes",
                self.request.request_id, self.transfer.bytes
            );
            self.stats.request_cancelled(self.transfer);
        }
    }
}
