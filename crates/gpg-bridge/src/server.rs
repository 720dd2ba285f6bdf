use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::agent::GpgAgent;
use crate::config::BridgeConfig;
use crate::session;

/// Shared application state.
#[derive(Clone)]
struct AppState {
    agent: Arc<GpgAgent>,
    queue_capacity: usize,
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

/// The WebSocket listener.
pub struct BridgeServer {
    agent: GpgAgent,
    queue_capacity: usize,
    shutdown_grace: Duration,
}

impl BridgeServer {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            agent: config.agent(),
            queue_capacity: config.result_queue_capacity,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Replace the agent built from the configuration.
    pub fn with_agent(mut self, agent: GpgAgent) -> Self {
        self.agent = agent;
        self
    }

    /// Serve on an already bound listener until `shutdown` is cancelled, then
    /// give in-flight sessions up to the grace period to finish.
    ///
    /// Idle sessions end as soon as `shutdown` fires; only a session that is
    /// still processing a command holds the grace period open.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener
            .local_addr()
            .context("failed to read listener address")?;
        let sessions = TaskTracker::new();
        let state = Arc::new(AppState {
            agent: Arc::new(self.agent),
            queue_capacity: self.queue_capacity,
            sessions: sessions.clone(),
            shutdown: shutdown.clone(),
        });

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(state);

        info!("gpg-bridge listening on ws://{local}/");
        let mut server = tokio::spawn(
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
        );

        tokio::select! {
            joined = &mut server => {
                sessions.close();
                return match joined {
                    Ok(result) => result.context("listener failed"),
                    Err(e) => Err(anyhow!("listener task failed: {e}")),
                };
            }
            () = shutdown.cancelled() => {}
        }

        info!(in_flight = sessions.len(), "shutdown requested");
        sessions.close();
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            match (&mut server).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("listener failed during shutdown: {e}"),
                Err(e) => warn!("listener task failed: {e}"),
            }
            sessions.wait().await;
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = sessions.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "shutdown grace period elapsed"
            );
            server.abort();
        }
        Ok(())
    }
}

/// Bind the configured loopback address and serve until `shutdown`.
pub async fn serve(config: BridgeConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    BridgeServer::new(&config).run(listener, shutdown).await
}

/// WebSocket upgrade handler.
///
/// Any `Origin` is accepted: the trust boundary is the loopback interface.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-");
    info!(%peer, origin, "client connected");

    let agent = Arc::clone(&state.agent);
    let queue_capacity = state.queue_capacity;
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| {
        state.sessions.track_future(session::handle_socket(
            socket,
            agent,
            queue_capacity,
            shutdown,
        ))
    })
}
