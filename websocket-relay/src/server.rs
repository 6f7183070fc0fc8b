use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use tokio::{net::TcpListener, select, time::timeout};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, HubConfig, ServerConfig},
    hub::{Hub, HubHandle},
    session, transport,
};

pub struct RelayServer {
    listener: TcpListener,
    config: ServerConfig,
    hub: Hub,
    handle: HubHandle,
}

impl RelayServer {
    pub fn new(
        listener: TcpListener,
        config: ServerConfig,
        hub_config: HubConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (hub, handle) = Hub::new(hub_config)?;
        Ok(Self {
            listener,
            config,
            hub,
            handle,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the hub this server feeds. Usable before and while the
    /// server runs.
    pub fn hub(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Serves the upgrade endpoint until `shutdown` resolves, then stops
    /// accepting, closes every peer and waits for both at most the shutdown
    /// grace period.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            config,
            hub,
            handle,
        } = self;
        tokio::pin!(shutdown);

        let mut hub_task = tokio::spawn(hub.run());
        let stop_accepting = CancellationToken::new();
        let app = router(handle.clone(), &config);
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop_accepting.clone().cancelled_owned());
        let mut serve_task = tokio::spawn(async move { serve.await });

        select! {
            _ = &mut shutdown => {}
            served = &mut serve_task => {
                warn!("listener stopped unexpectedly");
                let _ = handle.shutdown().await;
                let _ = hub_task.await;
                served??;
                return Ok(());
            }
            _ = &mut hub_task => {
                warn!("hub stopped unexpectedly");
                stop_accepting.cancel();
                serve_task.await??;
                return Ok(());
            }
        }

        info!("relay shutting down");
        stop_accepting.cancel();

        let drain = async {
            if let Err(err) = handle.shutdown().await {
                debug!(error = %err, "hub already stopped");
            }
            hub_task.await?;
            serve_task.await??;
            anyhow::Ok(())
        };
        match timeout(config.shutdown_grace, drain).await {
            Ok(result) => result,
            Err(_) => {
                warn!(grace = ?config.shutdown_grace, "shutdown grace period elapsed");
                Ok(())
            }
        }
    }

    /// Runs until ctrl-c, or SIGTERM on unix.
    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Router exposing the upgrade endpoint at the configured path.
pub fn router(hub: HubHandle, config: &ServerConfig) -> Router {
    Router::new()
        .route(&config.path, get(upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout))
        .with_state(hub)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(hub): State<HubHandle>,
) -> Response {
    debug!(%remote, "upgrade requested");
    let config = hub.config().clone();
    ws.max_message_size(config.max_message_size)
        .max_frame_size(config.max_message_size)
        .write_buffer_size(config.write_buffer_size)
        .on_failed_upgrade(move |err| warn!(%remote, error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = transport::websocket(socket);
            session::run(hub, sink, stream).await;
        })
}
