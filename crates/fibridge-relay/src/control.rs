//! Control listener: accepts host connections and runs one link per host.

use fibridge_proto::{framed, CodecError, ErrorCode, FrameReader, FrameWriter, Message, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};
use crate::link::ControlLink;
use crate::state::RelayState;

/// Frames queued for a host before senders wait.
const OUTBOUND_BUFFER: usize = 256;

/// Time the writer gets to flush after its link closes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub async fn run_control_listener(
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_host(stream, peer, state).await {
                            warn!("Control connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Control accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    info!("Control listener stopped, closing {} sessions", state.sessions.len());
    state.sessions.close_all();
}

async fn handle_host(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) -> Result<()> {
    stream.set_nodelay(true)?;
    serve_host(stream, peer, state).await
}

/// Run one control connection from handshake to close.
pub async fn serve_host<S>(stream: S, peer: SocketAddr, state: Arc<RelayState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = framed(stream, state.config.max_frame_len);

    let handshake = tokio::time::timeout(state.config.handshake_timeout, reader.next_message())
        .await
        .map_err(|_| RelayError::HandshakeTimeout(state.config.handshake_timeout))??;

    let resume = match handshake {
        Some(Message::Handshake {
            protocol_version,
            resume,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                writer
                    .send(&Message::Error {
                        code: ErrorCode::UnsupportedVersion,
                        message: format!(
                            "relay speaks protocol {}, host sent {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                        request_id: None,
                    })
                    .await?;
                return Err(RelayError::UnsupportedVersion(protocol_version));
            }
            resume
        }
        Some(other) => {
            writer
                .send(&Message::Error {
                    code: ErrorCode::HandshakeRejected,
                    message: format!("expected Handshake, got {}", other.kind()),
                    request_id: None,
                })
                .await?;
            return Err(RelayError::UnexpectedHandshake(other.kind()));
        }
        None => {
            debug!("{} closed before the handshake", peer);
            return Ok(());
        }
    };

    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (link, replaced) = state.sessions.attach(
        resume,
        peer,
        outbound,
        state.ids.as_ref(),
        &state.resume_key,
        state.config.body_buffer_chunks,
    );
    if let Some(stale) = replaced {
        info!(
            "Session {} resumed from {}, closing the link from {}",
            link.session_id(),
            peer,
            stale.peer()
        );
        stale.close();
    }

    if let Err(e) = writer
        .send(&Message::Welcome {
            session_id: link.session_id().to_string(),
            resume_token: state.resume_key.token_for(link.session_id()),
        })
        .await
    {
        state.sessions.detach(&link);
        link.fail_all("handshake failed");
        return Err(e.into());
    }
    info!("Host {} attached as session {}", peer, link.session_id());

    let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx, link.closed_token()));
    let result = read_loop(&mut reader, &link).await;

    state.sessions.detach(&link);
    link.fail_all("control connection closed");

    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await {
        Ok(Ok(Err(e))) => debug!("Session {} writer: {}", link.session_id(), e),
        Ok(_) => {}
        Err(_) => writer_task.abort(),
    }

    info!("Session {} detached", link.session_id());
    result
}

async fn read_loop<R>(reader: &mut FrameReader<R>, link: &ControlLink) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = link.closed() => return Ok(()),
            message = reader.next_message() => message,
        };

        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => return Err(report(link, e.into())),
        };

        if let Err(e) = link.deliver(message) {
            return Err(report(link, e));
        }
    }
}

/// Log a link-ending error and pass violations back to the host.
fn report(link: &ControlLink, err: RelayError) -> RelayError {
    if let RelayError::Codec(codec) = &err {
        if codec.is_protocol_violation() {
            error!("Session {}: {}", link.session_id(), codec);
            link.notify_error(ErrorCode::ProtocolViolation, codec.to_string());
        }
    }
    err
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
) -> std::result::Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => writer.send(&message).await?,
                None => break,
            },
            _ = closed.cancelled() => {
                while let Ok(message) = outbound.try_recv() {
                    writer.send(&message).await?;
                }
                break;
            }
        }
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayConfig;
    use fibridge_proto::{ByteRange, ResponseStatus, ResumeTicket, DEFAULT_MAX_FRAME_LEN};
    use tokio::io::DuplexStream;

    fn state() -> Arc<RelayState> {
        Arc::new(RelayState::new(RelayConfig {
            handshake_timeout: Duration::from_millis(200),
            ..RelayConfig::default()
        }))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    async fn connect(
        state: Arc<RelayState>,
    ) -> (
        FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        FrameWriter<tokio::io::WriteHalf<DuplexStream>>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (host, relay) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_host(relay, peer(), state));
        let (reader, writer) = framed(host, DEFAULT_MAX_FRAME_LEN);
        (reader, writer, task)
    }

    #[tokio::test]
    async fn test_handshake_assigns_session() {
        let state = state();
        let (mut reader, mut writer, _task) = connect(state.clone()).await;

        writer
            .send(&Message::Handshake {
                protocol_version: PROTOCOL_VERSION,
                resume: None,
            })
            .await
            .unwrap();
        let Some(Message::Welcome {
            session_id,
            resume_token,
        }) = reader.next_message().await.unwrap()
        else {
            panic!("expected Welcome");
        };
        assert!(state.sessions.get(&session_id).is_some());
        assert!(state.resume_key.verify(&session_id, &resume_token));
    }

    #[tokio::test]
    async fn test_wrong_version_is_refused() {
        let (mut reader, mut writer, task) = connect(state()).await;
        writer
            .send(&Message::Handshake {
                protocol_version: PROTOCOL_VERSION + 1,
                resume: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            reader.next_message().await.unwrap(),
            Some(Message::Error {
                code: ErrorCode::UnsupportedVersion,
                ..
            })
        ));
        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::UnsupportedVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let (_reader, _writer, task) = connect(state()).await;
        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::HandshakeTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let state = state();
        let (mut reader, mut writer, task) = connect(state.clone()).await;
        writer
            .send(&Message::Handshake {
                protocol_version: PROTOCOL_VERSION,
                resume: Some(ResumeTicket {
                    session_id: "k3x9-ab2c".to_string(),
                    token: state.resume_key.token_for("k3x9-ab2c"),
                }),
            })
            .await
            .unwrap();
        reader.next_message().await.unwrap();

        let link = state.sessions.get("k3x9-ab2c").unwrap();
        let mut request = link.open_request("/a", ByteRange::Full).await.unwrap();
        assert!(matches!(
            reader.next_message().await.unwrap(),
            Some(Message::RequestRange { .. })
        ));

        drop(reader);
        drop(writer);
        task.await.unwrap().unwrap();

        assert!(matches!(request.header().await, Err(RelayError::LinkClosed)));
        assert!(state.sessions.get("k3x9-ab2c").is_none());
    }

    #[tokio::test]
    async fn test_violation_is_reported_to_host() {
        let state = state();
        let (mut reader, mut writer, task) = connect(state.clone()).await;
        writer
            .send(&Message::Handshake {
                protocol_version: PROTOCOL_VERSION,
                resume: None,
            })
            .await
            .unwrap();
        reader.next_message().await.unwrap();

        // Frames for unknown ids are dropped (the request may have been
        // cancelled); a relay-only message is not.
        writer
            .send(&Message::ResponseHeader {
                request_id: 99,
                status: ResponseStatus::Ok,
                content_length: 0,
                range_start: 0,
                total_size: 0,
            })
            .await
            .unwrap();
        writer.send(&Message::Cancel { request_id: 1 }).await.unwrap();

        assert!(matches!(
            reader.next_message().await.unwrap(),
            Some(Message::Error {
                code: ErrorCode::ProtocolViolation,
                ..
            })
        ));
        assert!(matches!(task.await.unwrap(), Err(RelayError::Codec(_))));
    }
}
