use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use parley_core::traits::{CredentialValidator, LastSeenStore, MessageStore};

use crate::presence::PresenceRegistry;
use crate::relay::RelayRouter;
use crate::session;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    /// Window for the auth frame to arrive on a fresh connection.
    pub handshake_timeout: Duration,
    /// Server ping cadence.
    pub heartbeat_interval: Duration,
    /// Silence beyond this is a dead connection (a small multiple of the
    /// heartbeat interval).
    pub liveness_timeout: Duration,
    /// How often the sweeper looks for dead connections.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            max_send_queue: 256,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Everything a connection session needs, injected once at startup.
pub struct RelayDeps {
    pub presence: Arc<PresenceRegistry>,
    pub router: RelayRouter,
    pub validator: Arc<dyn CredentialValidator>,
    pub last_seen: Arc<dyn LastSeenStore>,
}

impl RelayDeps {
    pub fn new(
        store: Arc<dyn MessageStore>,
        validator: Arc<dyn CredentialValidator>,
        last_seen: Arc<dyn LastSeenStore>,
    ) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let router = RelayRouter::new(store, presence.clone());
        Self {
            presence,
            router,
            validator,
            last_seen,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<RelayDeps>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, deps: RelayDeps) -> Result<ServerHandle, std::io::Error> {
    let config = Arc::new(config);
    let deps = Arc::new(deps);

    let sweeper = start_sweeper(deps.presence.clone(), config.clone());

    let state = AppState {
        deps,
        config: config.clone(),
    };
    let router = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _sweeper: sweeper,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _sweeper: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::debug!("websocket connection accepted");
    session::run(socket, state.deps, state.config).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.deps.presence.count(),
    }))
}

/// Periodically cancel connections with no inbound traffic. Each swept
/// session tears itself down, which unregisters it, persists last-seen,
/// and notifies the counterpart.
fn start_sweeper(
    presence: Arc<PresenceRegistry>,
    config: Arc<ServerConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval);
        loop {
            ticker.tick().await;
            let cancelled = presence.sweep_stale(config.liveness_timeout);
            if cancelled > 0 {
                tracing::info!(cancelled, "dead connection sweep");
            }
        }
    })
}
