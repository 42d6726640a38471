//! WebSocket transport server with per-connection dispatch.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Connection A ── Dispatcher A ── registry A
//! Client B ──┼── accept loop ───────┼── Connection B ── Dispatcher B ── registry B
//! Client C ──┘   (one task each)    └── Connection C ── Dispatcher C ── registry C
//!                                              │
//!                                       SessionHooks (collaborator)
//!                                   on_connect / on_disconnect / errors
//! ```
//!
//! The server owns sockets, handshakes and lifecycles; it has no
//! opinion about message semantics. The collaborator supplies a
//! [`SessionHooks`] implementation whose `on_connect` builds the
//! session's handler registry before the first frame is read.
//!
//! Each connection runs on its own task: a slow or failing handler
//! delays only its own session. Within a session, frames dispatch in
//! strict arrival order and the next WebSocket message is not read
//! until the current handler finishes, so sustained slow handlers push
//! back on the socket instead of growing a queue.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::connection::{Connection, LifecycleState, Outgoing};
use crate::dispatch::{DispatchSnapshot, DispatchStats, Dispatcher};
use crate::registry::{HandlerRegistry, RegistryError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to when [`SyncServer::run`] opens its own listener
    pub bind_addr: String,
    /// Maximum accepted WebSocket message size in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub dispatch: DispatchSnapshot,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
}

/// How [`SyncServer::shutdown`] treats live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting new connections; open sessions keep running.
    Graceful,
    /// Stop accepting and close every live connection.
    Forceful,
}

/// Transport-level errors from the socket/server primitives.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    WebSocket(tokio_tungstenite::tungstenite::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::WebSocket(e) => write!(f, "websocket error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e)
    }
}

/// Error aborting session setup before any frame is dispatched.
#[derive(Debug)]
pub enum SessionError {
    /// Handler registration failed — a programming error in the
    /// collaborator's connect hook.
    Registry(RegistryError),
    /// The collaborator refused the session.
    Rejected(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "registry error: {e}"),
            Self::Rejected(reason) => write!(f, "session rejected: {reason}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

/// Connect handshake data captured during the WebSocket upgrade.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Request path as the client sent it, e.g. `/my-doc`.
    pub path: String,
    /// Document id, the final path segment.
    pub doc_id: String,
    /// Request headers, available for upstream authorization.
    pub headers: http::HeaderMap,
}

/// Collaborator-supplied session lifecycle hooks.
///
/// `on_connect` runs after the WebSocket upgrade and before the first
/// frame is read; it must register every handler the session needs.
/// An `Err` tears the session down without dispatching anything, and
/// `on_disconnect` is not called for a session that never opened.
pub trait SessionHooks: Send + Sync + 'static {
    fn on_connect(
        &self,
        conn: &Arc<Connection>,
        handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError>;

    /// Called once after the connection has closed.
    fn on_disconnect(&self, _conn: &Arc<Connection>) {}

    /// Observes transport-level errors; `conn_id` is `None` for errors
    /// not tied to a specific connection. Installed before any message
    /// is processed.
    fn on_transport_error(&self, conn_id: Option<Uuid>, error: &TransportError) {
        match conn_id {
            Some(id) => log::error!("transport error on connection {id}: {error}"),
            None => log::error!("transport error: {error}"),
        }
    }
}

/// The sync transport server.
pub struct SyncServer {
    config: ServerConfig,
    hooks: Arc<dyn SessionHooks>,
    /// Live connections: connection id → handle
    connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
    stats: Arc<AtomicServerStats>,
    dispatch_stats: Arc<DispatchStats>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server with the given configuration and hooks.
    pub fn new<H: SessionHooks>(config: ServerConfig, hooks: H) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            hooks: Arc::new(hooks),
            connections: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicServerStats::default()),
            dispatch_stats: Arc::new(DispatchStats::new()),
            shutdown_tx,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults<H: SessionHooks>(hooks: H) -> Self {
        Self::new(ServerConfig::default(), hooks)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    ///
    /// This is the attach path: the embedding process owns the endpoint
    /// (and whatever TLS termination sits in front of it) and hands the
    /// accepted socket source over.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("new tcp connection from {addr}");
                            let hooks = self.hooks.clone();
                            let connections = self.connections.clone();
                            let stats = self.stats.clone();
                            let dispatch_stats = self.dispatch_stats.clone();
                            let config = self.config.clone();

                            tokio::spawn(async move {
                                let observer = hooks.clone();
                                if let Err(e) = Self::handle_connection(
                                    stream, addr, hooks, connections, stats,
                                    dispatch_stats, config,
                                )
                                .await
                                {
                                    observer.on_transport_error(None, &e);
                                }
                            });
                        }
                        Err(e) => {
                            self.hooks.on_transport_error(None, &TransportError::Io(e));
                        }
                    }
                }
            }
        }

        log::info!("sync server stopped accepting connections");
        Ok(())
    }

    /// Stop the server.
    ///
    /// Graceful mode only stops the accept loop, matching the historical
    /// behavior of letting open sessions drain on their own; forceful
    /// mode additionally closes every live connection.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let _ = self.shutdown_tx.send(true);
        if mode == ShutdownMode::Forceful {
            let live: Vec<Arc<Connection>> =
                self.connections.read().await.values().cloned().collect();
            log::info!("forceful shutdown: closing {} connections", live.len());
            for conn in live {
                conn.close();
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            dispatch: self.dispatch_stats.snapshot(),
        }
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Handle a single client connection from upgrade to teardown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hooks: Arc<dyn SessionHooks>,
        connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,
        stats: Arc<AtomicServerStats>,
        dispatch_stats: Arc<DispatchStats>,
        config: ServerConfig,
    ) -> Result<(), TransportError> {
        // The upgrade callback runs before any frame is exchanged; it
        // captures the request metadata and rejects paths without a
        // document id.
        let handshake_slot: Arc<std::sync::Mutex<Option<Handshake>>> =
            Arc::new(std::sync::Mutex::new(None));
        let slot = handshake_slot.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let path = req.uri().path().to_string();
            match doc_id_from_path(&path) {
                Some(doc_id) => {
                    if let Ok(mut guard) = slot.lock() {
                        *guard = Some(Handshake {
                            path,
                            doc_id,
                            headers: req.headers().clone(),
                        });
                    }
                    Ok(resp)
                }
                None => {
                    let mut reject = ErrorResponse::new(Some("missing document id".to_string()));
                    *reject.status_mut() = http::StatusCode::BAD_REQUEST;
                    Err(reject)
                }
            }
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_frame_bytes);
        ws_config.max_frame_size = Some(config.max_frame_bytes);

        let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(ws_config),
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::WebSocket(e));
            }
        };

        let Some(handshake) = handshake_slot.lock().ok().and_then(|mut g| g.take()) else {
            log::warn!("handshake from {addr} produced no session metadata");
            return Ok(());
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(handshake.doc_id.clone(), out_tx);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!(
            "connection {} established from {addr} for document {}",
            conn.id(),
            conn.doc_id()
        );

        // Build the session's handler registry before the first frame.
        let mut registry = HandlerRegistry::new();
        if let Err(e) = hooks.on_connect(&conn, &handshake, &mut registry) {
            log::error!("connection {}: session setup failed: {e}", conn.id());
            conn.advance(LifecycleState::Closed);
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        }

        conn.advance(LifecycleState::Open);
        connections.write().await.insert(conn.id(), conn.clone());
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let dispatcher = Dispatcher::new(conn.clone(), registry, dispatch_stats);

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            dispatcher.dispatch(&bytes).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {} closed by peer", conn.id());
                            break;
                        }
                        Some(Err(e)) => {
                            hooks.on_transport_error(Some(conn.id()), &TransportError::WebSocket(e));
                            break;
                        }
                        // Text frames are not part of this protocol.
                        _ => {}
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(Outgoing::Frame(bytes)) => {
                            if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                                hooks.on_transport_error(Some(conn.id()), &TransportError::WebSocket(e));
                                break;
                            }
                        }
                        Some(Outgoing::Shutdown) | None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }

        // Teardown: no further frames are delivered; a handler that is
        // somehow still running sees its sends dropped silently.
        conn.advance(LifecycleState::Closing);
        conn.advance(LifecycleState::Closed);
        connections.write().await.remove(&conn.id());
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        hooks.on_disconnect(&conn);
        log::info!("connection {} closed", conn.id());

        Ok(())
    }
}

/// Extract the document id from the request path's final segment.
fn doc_id_from_path(path: &str) -> Option<String> {
    let segment = path.split('/').filter(|s| !s.is_empty()).last()?;
    Some(segment.to_string())
}
