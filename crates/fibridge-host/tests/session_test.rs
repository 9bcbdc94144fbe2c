//! Session integration tests against a scripted relay.
//!
//! The relay side is driven by hand over in-memory duplex pipes, so every
//! frame the host sends can be asserted on.

use async_trait::async_trait;
use bytes::Bytes;
use fibridge_host::{
    BackoffConfig, ConnectionState, Connector, DataSource, MemorySource, Session, SessionConfig,
    SessionError,
};
use fibridge_proto::{
    framed, ByteRange, ErrorCode, FrameReader, FrameWriter, Message, RequestId, ResponseStatus,
    ResumeTicket, DEFAULT_MAX_FRAME_LEN,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SESSION_ID: &str = "abcd-efgh";
const RESUME_TOKEN: &str = "5eb6c1e0a2f4";
/// Enough credit that a response never waits for a grant.
const OPEN_CREDIT: u32 = 1 << 20;
const STEP: Duration = Duration::from_secs(5);

fn init_test_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("fibridge_host=debug,fibridge_proto=debug"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_test_writer().with_target(false).compact())
            .try_init()
            .ok();
    });
}

#[derive(Clone)]
struct DuplexConnector {
    relay_ends: mpsc::UnboundedSender<DuplexStream>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _address: &str, _port: u16, _secure: bool) -> io::Result<DuplexStream> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "relay down"));
        }
        let (host, relay) = tokio::io::duplex(64 * 1024);
        self.relay_ends
            .send(relay)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no relay"))?;
        Ok(host)
    }
}

struct FakeRelay {
    ends: mpsc::UnboundedReceiver<DuplexStream>,
}

struct RelayEnd {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl FakeRelay {
    /// Accept the next control connection and complete its handshake.
    /// Returns the ticket the host presented.
    async fn accept(&mut self) -> (RelayEnd, Option<ResumeTicket>) {
        let stream = tokio::time::timeout(STEP, self.ends.recv())
            .await
            .expect("host never connected")
            .expect("connector dropped");
        let (reader, writer) = framed(stream, DEFAULT_MAX_FRAME_LEN);
        let mut end = RelayEnd { reader, writer };

        let resume = match end.recv().await {
            Message::Handshake {
                protocol_version,
                resume,
            } => {
                assert_eq!(protocol_version, fibridge_proto::PROTOCOL_VERSION);
                resume
            }
            other => panic!("expected Handshake, got {:?}", other),
        };
        end.send(Message::Welcome {
            session_id: SESSION_ID.to_string(),
            resume_token: RESUME_TOKEN.to_string(),
        })
        .await;
        (end, resume)
    }
}

impl RelayEnd {
    async fn recv(&mut self) -> Message {
        self.try_recv(STEP)
            .await
            .expect("timed out waiting for the host")
            .expect("host closed the connection")
    }

    async fn try_recv(&mut self, wait: Duration) -> Option<Option<Message>> {
        tokio::time::timeout(wait, self.reader.next_message())
            .await
            .ok()
            .map(|r| r.expect("bad frame from host"))
    }

    async fn send(&mut self, message: Message) {
        self.writer.send(&message).await.unwrap();
    }

    /// Collect one complete response: header plus body.
    async fn response(&mut self, request_id: u64) -> (Message, Vec<u8>) {
        let header = self.recv().await;
        assert_eq!(header.request_id(), Some(request_id));
        let mut body = Vec::new();

        if let Message::ResponseHeader { status, .. } = &header {
            if status.has_body() {
                loop {
                    match self.recv().await {
                        Message::Chunk {
                            request_id: id,
                            bytes,
                            is_final,
                            ..
                        } => {
                            assert_eq!(id, request_id);
                            body.extend_from_slice(&bytes);
                            if is_final {
                                break;
                            }
                        }
                        other => panic!("expected Chunk, got {:?}", other),
                    }
                }
            }
        }
        (header, body)
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        chunk_size: 4096,
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_retries: 5,
            jitter: false,
        },
        ..SessionConfig::default()
    }
}

fn pair() -> (DuplexConnector, FakeRelay, Arc<AtomicBool>) {
    init_test_logging();
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    (
        DuplexConnector {
            relay_ends: tx,
            refuse: refuse.clone(),
        },
        FakeRelay { ends: rx },
        refuse,
    )
}

async fn start(config: SessionConfig) -> (Session, FakeRelay, RelayEnd, Arc<AtomicBool>) {
    let (connector, mut relay, refuse) = pair();
    let (session, (end, resume)) = tokio::join!(Session::start(config, connector), relay.accept());
    assert_eq!(resume, None);
    (session.unwrap(), relay, end, refuse)
}

fn request(request_id: RequestId, virtual_path: &str, range: ByteRange) -> Message {
    Message::RequestRange {
        request_id,
        virtual_path: virtual_path.to_string(),
        range,
        credit: OPEN_CREDIT,
    }
}

fn ticket() -> Option<ResumeTicket> {
    Some(ResumeTicket {
        session_id: SESSION_ID.to_string(),
        token: RESUME_TOKEN.to_string(),
    })
}

fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_host_file_registers_and_builds_url() {
    let (session, _relay, mut end, _) = start(test_config()).await;
    let handle = session.handle();
    assert_eq!(handle.state(), ConnectionState::Open);
    assert_eq!(handle.session_id(), SESSION_ID);

    let hosted = handle
        .host_file("genome.bam", MemorySource::new(pattern(10_000)).into_handle(), None)
        .await
        .unwrap();
    assert_eq!(hosted.virtual_path, "/genome.bam");
    assert_eq!(hosted.relay_path, "/abcd-efgh/genome.bam");
    assert_eq!(hosted.url.as_str(), "http://127.0.0.1:8080/abcd-efgh/genome.bam");

    match end.recv().await {
        Message::Register {
            virtual_path,
            size_bytes,
            ..
        } => {
            assert_eq!(virtual_path, "/genome.bam");
            assert_eq!(size_bytes, 10_000);
        }
        other => panic!("expected Register, got {:?}", other),
    }
}

#[tokio::test]
async fn test_traversal_paths_are_rejected() {
    let (session, _relay, _end, _) = start(test_config()).await;
    let result = session
        .handle()
        .host_file("/../etc/passwd", MemorySource::new(&b"x"[..]).into_handle(), None)
        .await;
    assert!(matches!(result, Err(SessionError::Registry(_))));
}

#[tokio::test]
async fn test_range_request_is_answered() {
    let data = pattern(10_000);
    let (session, _relay, mut end, _) = start(test_config()).await;
    session
        .handle()
        .host_file("/genome.bam", MemorySource::new(data.clone()).into_handle(), None)
        .await
        .unwrap();
    end.recv().await; // Register

    end.send(request(0, "/genome.bam", ByteRange::Bounded { start: 0, end: 999 })).await;

    let (header, body) = end.response(0).await;
    assert_eq!(
        header,
        Message::ResponseHeader {
            request_id: 0,
            status: ResponseStatus::PartialContent,
            content_length: 1000,
            range_start: 0,
            total_size: 10_000,
        }
    );
    assert_eq!(body, data[..1000]);
}

#[tokio::test]
async fn test_unknown_path_and_bad_range() {
    let (session, _relay, mut end, _) = start(test_config()).await;
    session
        .handle()
        .host_file("/small.txt", MemorySource::new(&b"0123456789"[..]).into_handle(), None)
        .await
        .unwrap();
    end.recv().await;

    end.send(request(1, "/missing.txt", ByteRange::Full)).await;
    let (header, _) = end.response(1).await;
    assert!(matches!(
        header,
        Message::ResponseHeader {
            status: ResponseStatus::NotFound,
            ..
        }
    ));

    end.send(request(2, "/small.txt", ByteRange::From { start: 50 })).await;
    let (header, _) = end.response(2).await;
    assert!(matches!(
        header,
        Message::ResponseHeader {
            status: ResponseStatus::RangeNotSatisfiable,
            total_size: 10,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cancel_stops_the_stream() {
    let size = 4 * 1024 * 1024;
    let config = SessionConfig {
        outbound_buffer: 1,
        ..test_config()
    };
    let (session, _relay, mut end, _) = start(config).await;
    let handle = session.handle();
    handle
        .host_file("/big.bin", MemorySource::new(pattern(size)).into_handle(), None)
        .await
        .unwrap();
    handle
        .host_file("/small.txt", MemorySource::new(&b"small"[..]).into_handle(), None)
        .await
        .unwrap();
    end.recv().await;
    end.recv().await;

    end.send(request(1, "/big.bin", ByteRange::Full)).await;
    assert!(matches!(end.recv().await, Message::ResponseHeader { request_id: 1, .. }));
    assert!(matches!(end.recv().await, Message::Chunk { request_id: 1, .. }));

    end.send(Message::Cancel { request_id: 1 }).await;
    end.send(request(2, "/small.txt", ByteRange::Full)).await;

    let mut cancelled_bytes = 0usize;
    let mut small_done = false;
    while !small_done {
        match end.recv().await {
            Message::Chunk {
                request_id: 1,
                bytes,
                is_final,
                ..
            } => {
                assert!(!is_final, "cancelled stream ran to completion");
                cancelled_bytes += bytes.len();
            }
            Message::Chunk {
                request_id: 2,
                is_final,
                ..
            } => small_done = is_final,
            Message::ResponseHeader { request_id: 2, .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(cancelled_bytes < size);

    // Nothing more arrives for the cancelled request.
    assert!(end.try_recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_stream_waits_for_credit() {
    let (session, _relay, mut end, _) = start(test_config()).await;
    session
        .handle()
        .host_file("/three.bin", MemorySource::new(pattern(3 * 4096)).into_handle(), None)
        .await
        .unwrap();
    end.recv().await;

    end.send(Message::RequestRange {
        request_id: 9,
        virtual_path: "/three.bin".to_string(),
        range: ByteRange::Full,
        credit: 1,
    })
    .await;
    assert!(matches!(end.recv().await, Message::ResponseHeader { request_id: 9, .. }));
    assert!(matches!(
        end.recv().await,
        Message::Chunk {
            request_id: 9,
            sequence: 0,
            ..
        }
    ));
    assert!(end.try_recv(Duration::from_millis(200)).await.is_none());

    end.send(Message::Credit {
        request_id: 9,
        chunks: 2,
    })
    .await;
    assert!(matches!(
        end.recv().await,
        Message::Chunk { sequence: 1, .. }
    ));
    assert!(matches!(
        end.recv().await,
        Message::Chunk {
            sequence: 2,
            is_final: true,
            ..
        }
    ));

    // Grants for a finished request are ignored.
    end.send(Message::Credit {
        request_id: 9,
        chunks: 1,
    })
    .await;
    assert!(end.try_recv(Duration::from_millis(100)).await.is_none());
    assert_eq!(session.handle().state(), ConnectionState::Open);
}

struct FlakySource {
    good_reads: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl DataSource for FlakySource {
    fn identity(&self) -> &str {
        "flaky"
    }

    fn size(&self) -> u64 {
        16_384
    }

    async fn read_at(&self, _offset: u64, len: usize) -> io::Result<Bytes> {
        if self.good_reads.fetch_sub(1, Ordering::SeqCst) == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "device unplugged"));
        }
        Ok(Bytes::from(vec![7u8; len]))
    }
}

#[tokio::test]
async fn test_read_failure_mid_stream_fails_one_request() {
    let (session, _relay, mut end, _) = start(test_config()).await;
    let source = Arc::new(FlakySource {
        good_reads: std::sync::atomic::AtomicUsize::new(1),
    });
    session
        .handle()
        .host_file("/flaky.bin", source, None)
        .await
        .unwrap();
    end.recv().await;

    end.send(request(4, "/flaky.bin", ByteRange::Full)).await;

    assert!(matches!(
        end.recv().await,
        Message::ResponseHeader {
            status: ResponseStatus::Ok,
            content_length: 16_384,
            ..
        }
    ));
    assert!(matches!(
        end.recv().await,
        Message::Chunk {
            sequence: 0,
            is_final: false,
            ..
        }
    ));
    assert!(matches!(
        end.recv().await,
        Message::Error {
            code: ErrorCode::ReadFailed,
            request_id: Some(4),
            ..
        }
    ));
    assert_eq!(session.handle().state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_reconnect_resumes_session_and_replays_registry() {
    let (session, mut relay, mut end, _) = start(test_config()).await;
    let handle = session.handle();
    for path in ["/b.txt", "/a.txt"] {
        handle
            .host_file(path, MemorySource::new(&b"data"[..]).into_handle(), None)
            .await
            .unwrap();
        end.recv().await;
    }

    drop(end);

    let (mut end, resume) = relay.accept().await;
    assert_eq!(resume, ticket());

    let mut replayed = Vec::new();
    for _ in 0..2 {
        match end.recv().await {
            Message::Register { virtual_path, .. } => replayed.push(virtual_path),
            other => panic!("expected Register, got {:?}", other),
        }
    }
    assert_eq!(replayed, vec!["/a.txt", "/b.txt"]);

    assert_eq!(handle.wait_for(ConnectionState::Open).await, ConnectionState::Open);
    assert_eq!(handle.session_id(), SESSION_ID);

    end.send(request(0, "/a.txt", ByteRange::Full)).await;
    let (_, body) = end.response(0).await;
    assert_eq!(body, b"data");
}

#[tokio::test]
async fn test_reconnect_budget_exhausts_to_closed() {
    let config = SessionConfig {
        backoff: BackoffConfig {
            max_retries: 2,
            ..test_config().backoff
        },
        ..test_config()
    };
    let (session, _relay, end, refuse) = start(config).await;
    let handle = session.handle();

    refuse.store(true, Ordering::SeqCst);
    drop(end);

    let result = tokio::time::timeout(STEP, session.wait()).await.unwrap();
    assert!(matches!(
        result,
        Err(SessionError::ReconnectExhausted { attempts: 2, .. })
    ));
    assert_eq!(handle.state(), ConnectionState::Closed);

    let late = handle
        .host_file("/late.txt", MemorySource::new(&b"x"[..]).into_handle(), None)
        .await;
    assert!(matches!(late, Err(SessionError::Closed)));
}

#[tokio::test]
async fn test_protocol_violation_forces_reconnect() {
    let (_session, mut relay, mut end, _) = start(test_config()).await;

    // Register is host-only.
    end.send(Message::Register {
        virtual_path: "/x".to_string(),
        media_type: "text/plain".to_string(),
        size_bytes: 1,
    })
    .await;

    assert!(matches!(
        end.recv().await,
        Message::Error {
            code: ErrorCode::ProtocolViolation,
            request_id: None,
            ..
        }
    ));

    let (_end, resume) = relay.accept().await;
    assert_eq!(resume, ticket());
}

#[tokio::test]
async fn test_shutdown_closes_the_connection() {
    let (session, _relay, mut end, _) = start(test_config()).await;
    let handle = session.handle();

    session.shutdown().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(end.try_recv(STEP).await, Some(None));
}
