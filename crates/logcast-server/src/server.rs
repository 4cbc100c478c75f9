use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use logcast_core::SendError;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientConnection, ClientRegistry, Inbound, Transport};
use crate::event_loop::{self, LoopBridge};

const LOOP_THREAD_NAME: &str = "logcast-loop";

/// Log endpoint configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on one send to one client; expiry counts as a failed send.
    pub send_timeout: Duration,
    /// Capacity of the cross-thread job queue.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 7789,
            send_timeout: Duration::from_secs(5),
            queue_capacity: 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("event loop runtime error: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn event loop thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("event loop exited before it was ready")]
    LoopExited,

    #[error("event loop already running on this bridge")]
    AlreadyRunning,
}

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub client_registry: Arc<ClientRegistry>,
    pub bridge: LoopBridge,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the log endpoint on its own event loop thread.
///
/// Blocks until the listener is bound and the loop has published itself on
/// `bridge`, so a returned handle means broadcasts can be delivered.
pub fn start(
    config: &ServerConfig,
    registry: Arc<ClientRegistry>,
    bridge: LoopBridge,
) -> Result<ServerHandle, ServerError> {
    let addr = config.bind_addr();
    let queue_capacity = config.queue_capacity;
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<SocketAddr, ServerError>>(1);

    let thread = event_loop::spawn_loop_thread(LOOP_THREAD_NAME, move || async move {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = ready_tx.send(Err(ServerError::Bind { addr, source }));
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                let _ = ready_tx.send(Err(ServerError::Runtime(e)));
                return;
            }
        };
        if !bridge.attach(queue_capacity) {
            let _ = ready_tx.send(Err(ServerError::AlreadyRunning));
            return;
        }

        let router = build_router(AppState {
            client_registry: registry,
            bridge,
        });
        let _ = ready_tx.send(Ok(local_addr));

        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "log endpoint stopped");
        }
    })
    .map_err(ServerError::ThreadSpawn)?;

    let local_addr = ready_rx.recv().map_err(|_| ServerError::LoopExited)??;
    tracing::info!(addr = %local_addr, "log endpoint listening");

    Ok(ServerHandle { local_addr, thread })
}

/// Handle returned by [`start`]. Dropping it leaves the loop running.
pub struct ServerHandle {
    local_addr: SocketAddr,
    thread: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Block until the loop thread exits. Under normal operation it never does.
    pub fn join(self) -> Result<(), ServerError> {
        match self.thread.join() {
            Ok(result) => result.map_err(ServerError::Runtime),
            Err(_) => Err(ServerError::LoopExited),
        }
    }
}

/// Outbound half of an Axum WebSocket.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.to_owned().into()))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    let conn = Arc::new(ClientConnection::new(WsTransport::new(ws_tx)));

    let inbound = ws_rx.map(|msg| {
        msg.map(|m| match m {
            WsMessage::Close(_) => Inbound::Close,
            _ => Inbound::Payload,
        })
    });

    client::run_connection(conn, inbound, &state.client_registry).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "clients": state.client_registry.count(),
        "loop": if state.bridge.is_running() { "running" } else { "not_started" },
    }))
}
