//! The relay: accepts frames from publishers and fans them out to viewers.
//!
//! ## Routes
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/stream/ws` | Viewer WebSocket; receives JSON envelopes, text pings ignored |
//! | GET | `/stream/push-ws` | Publisher WebSocket; one binary JPEG per message |
//! | POST | `/stream/push` | Data-URL fallback for publishers without a socket |
//! | POST | `/stream/start` | Begin pulling a camera URL |
//! | POST | `/stream/stop` | Stop pulling |
//! | GET | `/stream/status` | Current pull and watcher count |
//!
//! Every frame, wherever it comes from, goes through the [`Hub`]: optional
//! analysis, then a `frame` envelope and possibly an `alert` broadcast to
//! every watcher in the same order.

pub mod analysis;
pub mod multipart;
pub mod pull_loop;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{
    PUSH_HTTP_PATH, PUSH_PATH, RelayConfig, START_PATH, STATUS_PATH, STOP_PATH, WATCH_PATH,
};
use crate::error::{RelayError, Result};
use crate::protocol::{
    Envelope, PullKind, PullStatus, PushBody, PushReply, RiskSignal, StartBody, decode_data_url,
};

pub use analysis::{Analysis, Analyzer, NoAnalysis};
pub use pull_loop::{PullManager, PullSource};
pub use registry::{Viewer, WatcherRegistry};

/// Turns frames into envelopes and hands them to every watcher.
pub struct Hub {
    registry: WatcherRegistry,
    analyzer: Arc<dyn Analyzer>,
    frames: AtomicU64,
}

impl Hub {
    pub fn new(registry: WatcherRegistry, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            registry,
            analyzer,
            frames: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &WatcherRegistry {
        &self.registry
    }

    /// Frames published since start.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Send one envelope to every watcher. Returns how many accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        match envelope.to_json() {
            Ok(text) => self.registry.broadcast(&text),
            Err(e) => {
                tracing::warn!(kind = envelope.tag(), error = %e, "envelope not serializable");
                0
            }
        }
    }

    /// Analyse and broadcast one JPEG frame. Returns the frame's risk, if
    /// the analyzer produced one.
    pub fn publish_frame(&self, jpeg: &[u8], kind: PullKind) -> Option<RiskSignal> {
        let analysis = self.analyzer.analyze(jpeg, kind);
        let risk = analysis.risk.clone();
        for envelope in analysis::frame_envelopes(jpeg, analysis) {
            self.broadcast(&envelope);
        }
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(frame = n, bytes = jpeg.len(), "frame published");
        risk
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(WatcherRegistry::default(), Arc::new(NoAnalysis))
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    pulls: Arc<PullManager>,
    shutdown: watch::Receiver<bool>,
}

/// HTTP/WebSocket relay server.
///
/// Owns the watcher registry and the pull manager. [`start`](Self::start)
/// binds and serves in the background; [`stop`](Self::stop) closes every
/// connection and halts pulling.
pub struct RelayServer {
    config: RelayConfig,
    hub: Arc<Hub>,
    pulls: Arc<PullManager>,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_analyzer(config, Arc::new(NoAnalysis))
    }

    /// Create a relay that scores every frame with `analyzer`.
    pub fn with_analyzer(config: RelayConfig, analyzer: Arc<dyn Analyzer>) -> Self {
        let hub = Arc::new(Hub::new(
            WatcherRegistry::new(config.watcher_queue),
            analyzer,
        ));
        let pulls = Arc::new(PullManager::new(hub.clone(), &config));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            hub,
            pulls,
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
            local_addr: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(&self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        self.shutdown.send_replace(false);

        let state = AppState {
            hub: self.hub.clone(),
            pulls: self.pulls.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        let app = router(state);
        let mut shutdown = self.shutdown.subscribe();
        let running = self.running.clone();

        tracing::info!(%addr, "relay listening");

        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "relay server failed");
            }
            running.store(false, Ordering::SeqCst);
        });
        *self.task.lock() = Some(task);
        Ok(addr)
    }

    /// Stop serving, close viewer and publisher connections, and stop any
    /// pull. Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.pulls.stop();
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("relay stopping");
        }
    }

    /// Wait for the server task to finish after [`stop`](Self::stop).
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        (*self.local_addr.lock()).ok_or(RelayError::NotStarted)
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.hub.registry().viewers()
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn pulls(&self) -> Arc<PullManager> {
        self.pulls.clone()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(WATCH_PATH, get(watch_handler))
        .route(PUSH_PATH, get(push_ws_handler))
        .route(PUSH_HTTP_PATH, post(push_http_handler))
        .route(START_PATH, post(start_handler))
        .route(STOP_PATH, post(stop_handler))
        .route(STATUS_PATH, get(status_handler))
        .with_state(state)
}

/// JSON error reply for the control endpoints.
struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            RelayError::InvalidSource(_) | RelayError::MalformedMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "ok": false, "error": self.0.to_string() }))).into_response()
    }
}

async fn watch_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_watcher(socket, peer, state))
}

async fn serve_watcher(socket: WebSocket, peer: SocketAddr, state: AppState) {
    let registry = state.hub.registry().clone();
    let (watcher, mut queue) = registry.register(&peer.to_string());
    let (mut sink, mut stream) = socket.split();
    let mut shutdown = state.shutdown;

    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outgoing = queue.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.to_string())).await {
                        tracing::debug!(watcher_id = %watcher.id, error = %e, "watcher send failed");
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                // Viewers only send liveness pings; nothing to do with them.
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(watcher_id = %watcher.id, error = %e, "watcher socket error");
                    break;
                }
            },
        }
    }

    registry.remove(&watcher.id);
}

/// Resolves once the server is told to stop. Returns `()` so no watch
/// borrow lives across the select arm.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[derive(Debug, Deserialize)]
struct PushQuery {
    #[serde(default)]
    kind: PullKind,
}

async fn push_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<PushQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_publisher(socket, peer, query.kind, state))
}

async fn serve_publisher(mut socket: WebSocket, peer: SocketAddr, kind: PullKind, state: AppState) {
    tracing::info!(%peer, %kind, "publisher connected");
    let mut shutdown = state.shutdown;
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(jpeg))) => {
                    if jpeg.is_empty() {
                        continue;
                    }
                    state.hub.publish_frame(&jpeg, kind);
                    frames += 1;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(_))) => {
                    tracing::debug!(%peer, "text on push channel ignored");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%peer, error = %e, "publisher socket error");
                    break;
                }
            },
        }
    }

    tracing::info!(%peer, frames, "publisher disconnected");
}

async fn push_http_handler(
    State(state): State<AppState>,
    Json(body): Json<PushBody>,
) -> std::result::Result<Json<PushReply>, ApiError> {
    let jpeg = decode_data_url(&body.image)?;
    let risk = state.hub.publish_frame(&jpeg, body.kind);
    Ok(Json(PushReply { ok: true, risk }))
}

async fn start_handler(
    State(state): State<AppState>,
    Json(body): Json<StartBody>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    state.pulls.start(&body.url, body.kind)?;
    Ok(Json(json!({ "ok": true })))
}

async fn stop_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.pulls.stop();
    Json(json!({ "ok": true }))
}

async fn status_handler(State(state): State<AppState>) -> Json<PullStatus> {
    let current = state.pulls.current();
    Json(PullStatus {
        state: (if current.is_some() { "running" } else { "stopped" }).to_string(),
        url: current.as_ref().map(|c| c.url.clone()),
        kind: current.map(|c| c.kind),
        watchers: state.hub.registry().len(),
    })
}
