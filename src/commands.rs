/*!
 * Relay and host modes of the `fibridge` binary
 */

use fibridge_host::{
    ConnectionState, FileSource, HostedFile, Session, SessionHandle, TcpConnector,
};
use fibridge_relay::RelayServer;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Run a relay until `shutdown` resolves.
pub async fn run_relay(config: &BridgeConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let server = RelayServer::bind(config.relay_config()).await?;
    println!("Relay listening for HTTP on {}", server.http_addr());
    println!("Hosts connect to {}", server.control_addr());

    let token = server.shutdown_token();
    tokio::select! {
        _ = shutdown => info!("Shutdown requested"),
        _ = token.cancelled() => {}
    }

    let stats = server.stats();
    server.shutdown().await?;
    info!(
        "Served {} requests ({} completed, {} cancelled, {} failed), {} bytes",
        stats.requests, stats.completed, stats.cancelled, stats.failed, stats.bytes_sent
    );
    Ok(())
}

/// Virtual path a local file is hosted under: `/<file name>`.
pub fn virtual_path_for(file: &Path) -> Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(|name| format!("/{}", name))
        .ok_or_else(|| BridgeError::Config(format!("{} has no usable file name", file.display())))
}

/// Open and host every file in `files` on an already started session.
pub async fn host_local_files(
    handle: &SessionHandle,
    files: &[PathBuf],
) -> Result<Vec<HostedFile>> {
    let mut hosted = Vec::with_capacity(files.len());
    for file in files {
        let path = virtual_path_for(file)?;
        let source = FileSource::open(file)
            .await
            .map_err(|source| BridgeError::Source {
                path: file.clone(),
                source,
            })?;
        hosted.push(handle.host_file(&path, source.into_handle(), None).await?);
    }
    Ok(hosted)
}

/// Connect to the relay, host `files` and serve until `shutdown` resolves
/// or the session gives up reconnecting.
pub async fn run_host(
    config: &BridgeConfig,
    files: &[PathBuf],
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    if files.is_empty() {
        return Err(BridgeError::Config("no files to host".to_string()));
    }

    let session = Session::start(config.session_config(), TcpConnector).await?;
    let handle = session.handle();
    info!("Session {} open", handle.session_id());

    let hosted = match host_local_files(&handle, files).await {
        Ok(hosted) => hosted,
        Err(e) => {
            if let Err(close) = session.shutdown().await {
                warn!("Closing session after failed setup: {}", close);
            }
            return Err(e);
        }
    };
    for file in &hosted {
        println!("{}  ({} bytes, {})", file.url, file.size_bytes, file.media_type);
    }

    let mut states = handle.subscribe();
    let watch_states = async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Reconnecting => warn!("Lost the relay, reconnecting"),
                ConnectionState::Open => info!("Connected to the relay again"),
                ConnectionState::Closed => break,
                ConnectionState::Connecting => {}
            }
        }
    };

    tokio::select! {
        _ = shutdown => {
            info!("Shutdown requested");
            session.shutdown().await?;
        }
        _ = watch_states => {
            session.wait().await?;
        }
    }
    Ok(())
}
