//! Relay server: binds both listeners and runs them until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::control::run_control_listener;
use crate::error::{RelayError, Result};
use crate::http::router;
use crate::state::{RelayConfig, RelayState};
use crate::stats::StatsSnapshot;

pub struct RelayServer {
    http_addr: SocketAddr,
    control_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
    http_task: JoinHandle<std::io::Result<()>>,
    control_task: JoinHandle<()>,
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
        addr: addr.to_string(),
        source,
    })
}

impl RelayServer {
    /// Bind the HTTP and control listeners and start serving.
    ///
    /// Port 0 picks an ephemeral port; [`RelayServer::http_addr`] and
    /// [`RelayServer::control_addr`] report what was bound.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let http = bind(&config.http_addr).await?;
        let control = bind(&config.control_addr).await?;
        let http_addr = http.local_addr()?;
        let control_addr = control.local_addr()?;

        let state = Arc::new(RelayState::new(config));
        let shutdown = CancellationToken::new();

        let control_task = tokio::spawn(run_control_listener(
            control,
            state.clone(),
            shutdown.clone(),
        ));

        let app = router(state.clone());
        let signal = shutdown.clone();
        let http_task = tokio::spawn(async move {
            axum::serve(http, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!(
            "Relay serving HTTP on http://{}, hosts connect to {}",
            http_addr, control_addr
        );

        Ok(Self {
            http_addr,
            control_addr,
            state,
            shutdown,
            http_task,
            control_task,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting, close every session and wait for in-flight responses.
    pub async fn shutdown(self) -> Result<()> {
        info!("Relay shutting down");
        self.shutdown.cancel();
        self.wait().await
    }

    /// Run until the shutdown token is cancelled.
    pub async fn wait(self) -> Result<()> {
        self.control_task
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))?;
        self.http_task
            .await
            .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;
        info!("Relay stopped");
        Ok(())
    }
}
