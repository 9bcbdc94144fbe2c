//! Host session: one control connection to a relay, kept alive across drops.
//!
//! The session is an actor. A single driver task owns the [`PathRegistry`] and
//! the live connection; [`SessionHandle`]s talk to it over a command channel.
//! Every forwarded range request runs as its own task, so a slow read never
//! blocks the control loop and a `Cancel` can abort exactly one stream.
//!
//! State machine:
//!
//! ```text
//! Connecting ──► Open ──► Reconnecting ──► Open ...
//!                  │            │
//!                  └────────────┴──► Closed
//! ```
//!
//! After every reconnect the registry is replayed in full, so a relay never
//! serves a path the host has not (re)announced on the current connection.
//!
//! Each read only sends as many chunks as the relay has granted credit for;
//! a read that runs out parks until the relay sends more.

use async_trait::async_trait;
use fibridge_proto::{
    framed, ByteRange, ErrorCode, FrameReader, FrameWriter, Message, RequestId, ResponseStatus,
    ResumeTicket, DEFAULT_MAX_FRAME_LEN, PROTOCOL_VERSION,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{RegistryError, Result, SessionError};
use crate::registry::{HostedEntry, PathRegistry};
use crate::slicer::{resolve_range, RangeSlicer, DEFAULT_CHUNK_SIZE};
use crate::source::SourceHandle;
use crate::url::{hosted_path, hosted_url};

/// Time the writer gets to flush queued frames on shutdown.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for one host session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay host name or address, also used in hosted URLs.
    pub relay_address: String,

    /// Public HTTP port of the relay (hosted URLs only).
    pub port: u16,

    /// Port of the relay's control listener.
    pub control_port: u16,

    /// Hosted URLs use `https` when set.
    pub secure: bool,

    /// Upper bound on the bytes carried by one `Chunk`.
    pub chunk_size: usize,

    /// Largest frame accepted from the relay.
    pub max_frame_len: usize,

    /// Time allowed for the relay to answer a `Handshake`.
    pub handshake_timeout: Duration,

    /// Frames queued for the writer before request tasks wait.
    pub outbound_buffer: usize,

    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_address: "127.0.0.1".to_string(),
            port: 8080,
            control_port: 8081,
            secure: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            handshake_timeout: Duration::from_secs(10),
            outbound_buffer: 64,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Lifecycle of the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Opens the byte stream a control connection runs over.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// `secure` asks for an encrypted stream where the connector supports it.
    async fn connect(&self, address: &str, port: u16, secure: bool) -> io::Result<Self::Stream>;
}

/// Plain TCP. TLS, when wanted, is terminated in front of the relay, so
/// `secure` only changes the scheme of hosted URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, address: &str, port: u16, _secure: bool) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((address, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// A path hosted by this session, with the URL clients should fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedFile {
    pub virtual_path: String,
    /// `/{session_id}{virtual_path}`, the path the relay routes.
    pub relay_path: String,
    pub url: Url,
    pub size_bytes: u64,
    pub media_type: String,
}

enum Command {
    Host {
        path: String,
        source: SourceHandle,
        media_type: Option<String>,
        reply: oneshot::Sender<std::result::Result<HostedEntry, RegistryError>>,
    },
    Unhost {
        path: String,
        reply: oneshot::Sender<std::result::Result<HostedEntry, RegistryError>>,
    },
    List {
        reply: oneshot::Sender<Vec<HostedEntry>>,
    },
    Shutdown,
}

/// Cheap, clonable access to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    session_id: watch::Receiver<String>,
    config: Arc<SessionConfig>,
}

impl SessionHandle {
    /// Host `source` at `path` and return its public URL.
    ///
    /// Works in any state but Closed; while reconnecting the registration is
    /// announced as soon as the connection is Open again.
    pub async fn host_file(
        &self,
        path: &str,
        source: SourceHandle,
        media_type: Option<&str>,
    ) -> Result<HostedFile> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Host {
            path: path.to_string(),
            source,
            media_type: media_type.map(str::to_string),
            reply,
        })
        .await?;
        let entry = rx.await.map_err(|_| SessionError::Closed)??;
        self.hosted_file(&entry)
    }

    /// Stop hosting `path`.
    pub async fn unhost(&self, path: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unhost {
            path: path.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)??;
        Ok(())
    }

    /// Every hosted path, ordered by virtual path.
    pub async fn hosted_files(&self) -> Result<Vec<HostedFile>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        let entries = rx.await.map_err(|_| SessionError::Closed)?;
        entries.iter().map(|e| self.hosted_file(e)).collect()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Session id assigned by the relay on the current connection.
    pub fn session_id(&self) -> String {
        self.session_id.borrow().clone()
    }

    /// Public URL for a virtual path under the current session id.
    pub fn url_for(&self, virtual_path: &str) -> Result<Url> {
        hosted_url(
            &self.config.relay_address,
            self.config.port,
            self.config.secure,
            &self.session_id(),
            virtual_path,
        )
        .map_err(|e| SessionError::InvalidAddress(format!("{}: {}", self.config.relay_address, e)))
    }

    /// Wait until the connection reaches `target`, or Closed.
    pub async fn wait_for(&self, target: ConnectionState) -> ConnectionState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == target || *s == ConnectionState::Closed)
            .await
            .map(|reached| *reached);
        reached.unwrap_or(ConnectionState::Closed)
    }

    fn hosted_file(&self, entry: &HostedEntry) -> Result<HostedFile> {
        Ok(HostedFile {
            virtual_path: entry.virtual_path.clone(),
            relay_path: hosted_path(&self.session_id(), &entry.virtual_path),
            url: self.url_for(&entry.virtual_path)?,
            size_bytes: entry.size_bytes,
            media_type: entry.media_type.clone(),
        })
    }

    async fn send(&self, command: Command) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// An established host session.
pub struct Session {
    handle: SessionHandle,
    driver: JoinHandle<Result<()>>,
}

impl Session {
    /// Connect to the relay and complete the handshake.
    ///
    /// Returns once the connection is Open. Connection failures are retried
    /// with the configured backoff; when the budget runs out the error is
    /// `ReconnectExhausted`.
    pub async fn start<C: Connector>(config: SessionConfig, connector: C) -> Result<Session> {
        let config = Arc::new(config);
        let mut backoff = Backoff::new(config.backoff.clone());

        info!(
            "Connecting to relay {}:{}",
            config.relay_address, config.control_port
        );
        let link = loop {
            match establish(&connector, &config, None).await {
                Ok(link) => break link,
                Err(e) if e.is_recoverable() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(SessionError::ReconnectExhausted {
                            attempts: backoff.attempts(),
                            last_error: e.to_string(),
                        });
                    };
                    warn!(
                        "Relay connection failed: {}. Retrying in {:?} (attempt {})",
                        e,
                        delay,
                        backoff.attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let (command_tx, command_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (session_id_tx, session_id_rx) = watch::channel(link.session_id.clone());

        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            session_id: session_id_rx,
            config: config.clone(),
        };

        let driver = Driver {
            slicer: RangeSlicer::new(config.chunk_size),
            config,
            connector,
            registry: PathRegistry::new(),
            commands: command_rx,
            state: state_tx,
            session_id: session_id_tx,
            resume_token: link.resume_token.clone(),
            backoff,
        };
        driver.set_state(ConnectionState::Open);
        let driver = tokio::spawn(driver.run(link));

        Ok(Session { handle, driver })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Wait for the driver to stop on its own (reconnect budget spent).
    pub async fn wait(self) -> Result<()> {
        join_driver(self.driver).await
    }

    /// Close the control connection and stop the session.
    pub async fn shutdown(self) -> Result<()> {
        // An error here means the driver is already gone; join reports why.
        let _ = self.handle.commands.send(Command::Shutdown).await;
        join_driver(self.driver).await
    }
}

async fn join_driver(driver: JoinHandle<Result<()>>) -> Result<()> {
    match driver.await {
        Ok(result) => result,
        Err(e) => {
            error!("Session driver panicked: {}", e);
            Err(SessionError::Closed)
        }
    }
}

struct Link<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    session_id: String,
    resume_token: String,
}

/// Connect and run the handshake, resuming the ticket's session when given.
async fn establish<C: Connector>(
    connector: &C,
    config: &SessionConfig,
    resume: Option<ResumeTicket>,
) -> Result<Link<C::Stream>> {
    let stream = connector
        .connect(&config.relay_address, config.control_port, config.secure)
        .await?;
    let (mut reader, mut writer) = framed(stream, config.max_frame_len);

    writer
        .send(&Message::Handshake {
            protocol_version: PROTOCOL_VERSION,
            resume: resume.clone(),
        })
        .await?;

    let reply = tokio::time::timeout(config.handshake_timeout, reader.next_message())
        .await
        .map_err(|_| {
            SessionError::HandshakeFailed(format!(
                "no answer within {:?}",
                config.handshake_timeout
            ))
        })??;

    match reply {
        Some(Message::Welcome {
            session_id,
            resume_token,
        }) => {
            if let Some(previous) = resume.filter(|ticket| ticket.session_id != session_id) {
                warn!(
                    "Relay assigned session {} instead of resuming {}; hosted URLs changed",
                    session_id, previous.session_id
                );
            }
            info!("Control connection open, session {}", session_id);
            Ok(Link {
                reader,
                writer,
                session_id,
                resume_token,
            })
        }
        Some(Message::Error { code, message, .. }) => Err(SessionError::HandshakeFailed(format!(
            "relay refused handshake ({:?}): {}",
            code, message
        ))),
        Some(other) => Err(SessionError::ProtocolViolation(format!(
            "expected Welcome, got {}",
            other.kind()
        ))),
        None => Err(SessionError::TransportLost(
            "relay closed the connection during the handshake".to_string(),
        )),
    }
}

/// Why a connection stopped being served.
enum Exit {
    Shutdown,
    Lost(SessionError),
}

struct Driver<C: Connector> {
    config: Arc<SessionConfig>,
    connector: C,
    registry: PathRegistry,
    slicer: RangeSlicer,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    session_id: watch::Sender<String>,
    /// Proves ownership of `session_id` when reconnecting.
    resume_token: String,
    backoff: Backoff,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self, mut link: Link<C::Stream>) -> Result<()> {
        loop {
            let cause = match self.serve(link).await {
                Exit::Shutdown => {
                    info!("Session {} shut down", self.session_id.borrow().as_str());
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                Exit::Lost(cause) => cause,
            };

            warn!("{}", cause);
            self.set_state(ConnectionState::Reconnecting);

            link = match self.reconnect(cause).await {
                Ok(Some(link)) => link,
                Ok(None) => {
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                Err(fatal) => {
                    error!("{}", fatal);
                    self.set_state(ConnectionState::Closed);
                    return Err(fatal);
                }
            };
            self.set_state(ConnectionState::Open);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    /// Back off and reconnect, still serving registry commands meanwhile.
    ///
    /// `Ok(None)` means shutdown was requested during the outage.
    async fn reconnect(&mut self, cause: SessionError) -> Result<Option<Link<C::Stream>>> {
        let mut last_error = cause.to_string();

        loop {
            let Some(delay) = self.backoff.next_delay() else {
                return Err(SessionError::ReconnectExhausted {
                    attempts: self.backoff.attempts(),
                    last_error,
                });
            };
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                self.backoff.attempts(),
                self.config.backoff.max_retries
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(Command::Shutdown) | None => return Ok(None),
                        Some(command) => self.on_command(command, None).await,
                    },
                }
            }

            let resume = Some(ResumeTicket {
                session_id: self.session_id.borrow().clone(),
                token: self.resume_token.clone(),
            });
            match establish(&self.connector, &self.config, resume).await {
                Ok(link) => return Ok(Some(link)),
                Err(e) if e.is_recoverable() => {
                    warn!("Reconnect attempt {} failed: {}", self.backoff.attempts(), e);
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Serve one open connection until it drops or shutdown is requested.
    async fn serve(&mut self, link: Link<C::Stream>) -> Exit {
        let Link {
            mut reader,
            writer,
            session_id,
            resume_token,
        } = link;
        self.session_id.send_replace(session_id);
        self.resume_token = resume_token;
        self.backoff.reset();

        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        let mut writer_done = false;

        let mut reads = ActiveReads::default();

        let exit = 'serve: {
            for entry in self.registry.entries() {
                if outbound.send(register_message(entry)).await.is_err() {
                    break 'serve Exit::Lost(SessionError::TransportLost(
                        "writer stopped during registry replay".to_string(),
                    ));
                }
            }
            debug!("Replayed {} registrations", self.registry.len());

            loop {
                tokio::select! {
                    message = reader.next_message() => match message {
                        Ok(Some(message)) => {
                            if let Err(e) = self.on_message(message, &outbound, &mut reads) {
                                if let SessionError::ProtocolViolation(reason) = &e {
                                    let _ = outbound.try_send(Message::Error {
                                        code: ErrorCode::ProtocolViolation,
                                        message: reason.clone(),
                                        request_id: None,
                                    });
                                }
                                break Exit::Lost(e);
                            }
                        }
                        Ok(None) => {
                            break Exit::Lost(SessionError::TransportLost(
                                "relay closed the control connection".to_string(),
                            ))
                        }
                        Err(e) => break Exit::Lost(e.into()),
                    },
                    command = self.commands.recv() => match command {
                        Some(Command::Shutdown) | None => break Exit::Shutdown,
                        Some(command) => self.on_command(command, Some(&outbound)).await,
                    },
                    Some(done) = reads.tasks.join_next(), if !reads.tasks.is_empty() => {
                        reads.finished(done);
                    }
                    result = &mut writer_task => {
                        writer_done = true;
                        let reason = match result {
                            Ok(Ok(())) => "writer stopped".to_string(),
                            Ok(Err(e)) => e.to_string(),
                            Err(e) => format!("writer task failed: {}", e),
                        };
                        break Exit::Lost(SessionError::TransportLost(reason));
                    }
                }
            }
        };

        let in_flight = reads.abort_all();
        if in_flight > 0 {
            debug!("Aborted {} in-flight reads", in_flight);
        }
        drop(outbound);

        if !writer_done {
            // Shutdown and violation reports are worth delivering.
            let flush = matches!(
                exit,
                Exit::Shutdown | Exit::Lost(SessionError::ProtocolViolation(_))
            );
            if !flush
                || tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, &mut writer_task)
                    .await
                    .is_err()
            {
                writer_task.abort();
            }
        }

        exit
    }

    fn on_message(
        &mut self,
        message: Message,
        outbound: &mpsc::Sender<Message>,
        reads: &mut ActiveReads,
    ) -> Result<()> {
        if !message.is_relay_originated() {
            return Err(SessionError::ProtocolViolation(format!(
                "relay sent host-only message {}",
                message.kind()
            )));
        }

        match message {
            Message::RequestRange {
                request_id,
                virtual_path,
                range,
                credit,
            } => {
                if reads.contains(request_id) {
                    return Err(SessionError::ProtocolViolation(format!(
                        "request id {} reused while still active",
                        request_id
                    )));
                }
                debug!("Request {}: {} {:?}", request_id, virtual_path, range);

                let lookup = self.registry.resolve(&virtual_path).cloned();
                let credit = Arc::new(Semaphore::new(credit as usize));
                let task = serve_range(
                    request_id,
                    lookup,
                    range,
                    self.slicer,
                    credit.clone(),
                    outbound.clone(),
                );
                reads.spawn(request_id, credit, task);
                Ok(())
            }
            Message::Credit { request_id, chunks } => {
                reads.grant(request_id, chunks);
                Ok(())
            }
            Message::Cancel { request_id } => {
                if reads.cancel(request_id) {
                    debug!("Request {} cancelled", request_id);
                } else {
                    debug!("Cancel for finished request {}", request_id);
                }
                Ok(())
            }
            Message::Error {
                code,
                message,
                request_id,
            } => match (code, request_id) {
                (_, Some(request_id)) => {
                    warn!("Relay failed request {}: {}", request_id, message);
                    reads.cancel(request_id);
                    Ok(())
                }
                (ErrorCode::Shutdown, None) => Err(SessionError::TransportLost(format!(
                    "relay shutting down: {}",
                    message
                ))),
                (code, None) => Err(SessionError::TransportLost(format!(
                    "relay reported {:?}: {}",
                    code, message
                ))),
            },
            Message::Welcome { .. } => Err(SessionError::ProtocolViolation(
                "Welcome after the handshake".to_string(),
            )),
            other => Err(SessionError::ProtocolViolation(format!(
                "unexpected {}",
                other.kind()
            ))),
        }
    }

    async fn on_command(&mut self, command: Command, outbound: Option<&mpsc::Sender<Message>>) {
        match command {
            Command::Host {
                path,
                source,
                media_type,
                reply,
            } => {
                let result = self.registry.register(&path, source, media_type.as_deref());
                if let (Ok(entry), Some(outbound)) = (&result, outbound) {
                    if outbound.send(register_message(entry)).await.is_err() {
                        debug!("Connection closing; {} is announced on reconnect", entry.virtual_path);
                    }
                }
                let _ = reply.send(result);
            }
            Command::Unhost { path, reply } => {
                let result = self.registry.unregister(&path);
                if let Ok(entry) = &result {
                    info!("Stopped hosting {}", entry.virtual_path);
                    if let Some(outbound) = outbound {
                        let _ = outbound
                            .send(Message::Unregister {
                                virtual_path: entry.virtual_path.clone(),
                            })
                            .await;
                    }
                }
                let _ = reply.send(result);
            }
            Command::List { reply } => {
                let _ = reply.send(self.registry.entries().cloned().collect());
            }
            // Handled by the caller's select loop.
            Command::Shutdown => {}
        }
    }
}

struct ActiveRead {
    abort: AbortHandle,
    credit: Arc<Semaphore>,
}

/// Range reads in flight on the current connection.
#[derive(Default)]
struct ActiveReads {
    tasks: JoinSet<RequestId>,
    handles: HashMap<RequestId, ActiveRead>,
}

impl ActiveReads {
    fn contains(&self, request_id: RequestId) -> bool {
        self.handles.contains_key(&request_id)
    }

    fn spawn<F>(&mut self, request_id: RequestId, credit: Arc<Semaphore>, task: F)
    where
        F: std::future::Future<Output = RequestId> + Send + 'static,
    {
        let abort = self.tasks.spawn(task);
        self.handles.insert(request_id, ActiveRead { abort, credit });
    }

    /// Let a read send `chunks` more chunks. Grants for finished reads are dropped.
    fn grant(&self, request_id: RequestId, chunks: u32) {
        if let Some(read) = self.handles.get(&request_id) {
            let room = Semaphore::MAX_PERMITS - read.credit.available_permits();
            read.credit.add_permits((chunks as usize).min(room));
        }
    }

    fn cancel(&mut self, request_id: RequestId) -> bool {
        match self.handles.remove(&request_id) {
            Some(read) => {
                read.abort.abort();
                true
            }
            None => false,
        }
    }

    fn finished(&mut self, done: std::result::Result<RequestId, tokio::task::JoinError>) {
        match done {
            Ok(request_id) => {
                self.handles.remove(&request_id);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Range read task failed: {}", e),
        }
    }

    fn abort_all(&mut self) -> usize {
        let count = self.handles.len();
        self.handles.clear();
        self.tasks.abort_all();
        count
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
) -> std::result::Result<(), fibridge_proto::CodecError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        writer.send(&message).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

fn register_message(entry: &HostedEntry) -> Message {
    Message::Register {
        virtual_path: entry.virtual_path.clone(),
        media_type: entry.media_type.clone(),
        size_bytes: entry.size_bytes,
    }
}

fn header(request_id: RequestId, status: ResponseStatus, total_size: u64) -> Message {
    Message::ResponseHeader {
        request_id,
        status,
        content_length: 0,
        range_start: 0,
        total_size,
    }
}

/// Wait until the relay allows one more chunk.
async fn take_credit(credit: &Semaphore) {
    // The semaphore is never closed, so acquire only returns once a permit is free.
    if let Ok(permit) = credit.acquire().await {
        permit.forget();
    }
}

/// Answer one `RequestRange`: a header, then the chunk stream.
async fn serve_range(
    request_id: RequestId,
    lookup: std::result::Result<HostedEntry, RegistryError>,
    range: ByteRange,
    slicer: RangeSlicer,
    credit: Arc<Semaphore>,
    outbound: mpsc::Sender<Message>,
) -> RequestId {
    if stream_range(request_id, lookup, range, slicer, &credit, &outbound)
        .await
        .is_err()
    {
        debug!("Request {} abandoned, connection closing", request_id);
    }
    request_id
}

async fn stream_range(
    request_id: RequestId,
    lookup: std::result::Result<HostedEntry, RegistryError>,
    range: ByteRange,
    slicer: RangeSlicer,
    credit: &Semaphore,
    outbound: &mpsc::Sender<Message>,
) -> std::result::Result<(), mpsc::error::SendError<Message>> {
    let entry = match lookup {
        Ok(entry) => entry,
        Err(e) => {
            debug!("Request {}: {}", request_id, e);
            return outbound
                .send(header(request_id, ResponseStatus::NotFound, 0))
                .await;
        }
    };

    let span = match resolve_range(entry.size_bytes, range) {
        Ok(span) => span,
        Err(e) => {
            debug!("Request {}: {}", request_id, e);
            return outbound
                .send(header(
                    request_id,
                    ResponseStatus::RangeNotSatisfiable,
                    entry.size_bytes,
                ))
                .await;
        }
    };

    let mut chunks = slicer.read_span(entry.source.clone(), span);

    // Read ahead one chunk so an unreadable source still gets a clean status.
    let mut next = chunks.next().await;
    if let Some(Err(e)) = &next {
        warn!("Request {}: reading {} failed: {}", request_id, entry.virtual_path, e);
        return outbound
            .send(header(request_id, ResponseStatus::Error, entry.size_bytes))
            .await;
    }

    let status = if range.is_partial() {
        ResponseStatus::PartialContent
    } else {
        ResponseStatus::Ok
    };
    outbound
        .send(Message::ResponseHeader {
            request_id,
            status,
            content_length: span.len,
            range_start: span.start,
            total_size: entry.size_bytes,
        })
        .await?;

    if span.len == 0 {
        take_credit(credit).await;
        return outbound
            .send(Message::Chunk {
                request_id,
                sequence: 0,
                bytes: bytes::Bytes::new(),
                is_final: true,
            })
            .await;
    }

    let mut sequence = 0;
    let mut sent = 0u64;
    while let Some(item) = next {
        match item {
            Ok(bytes) => {
                sent += bytes.len() as u64;
                let is_final = sent == span.len;
                take_credit(credit).await;
                outbound
                    .send(Message::Chunk {
                        request_id,
                        sequence,
                        bytes,
                        is_final,
                    })
                    .await?;
                if is_final {
                    return Ok(());
                }
                sequence += 1;
            }
            Err(e) => {
                warn!(
                    "Request {}: read of {} failed after {} bytes: {}",
                    request_id, entry.virtual_path, sent, e
                );
                return outbound
                    .send(Message::Error {
                        code: ErrorCode::ReadFailed,
                        message: e.to_string(),
                        request_id: Some(request_id),
                    })
                    .await;
            }
        }
        next = chunks.next().await;
    }

    outbound
        .send(Message::Error {
            code: ErrorCode::ReadFailed,
            message: format!("source ended after {} of {} bytes", sent, span.len),
            request_id: Some(request_id),
        })
        .await
}
