//! Frame-level WebSocket client for the sync transport.
//!
//! Connects to a transport server, speaks the varint-tagged frame
//! format, and hands decoded frames to the caller. Everything above
//! the frame — CRDT state vectors, awareness payloads — is the
//! caller's business, mirroring the server side where payloads belong
//! to the registered handlers.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{self, MessageType};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Client errors.
#[derive(Debug)]
pub enum ClientError {
    /// The WebSocket connect/upgrade failed.
    Connect(tokio_tungstenite::tungstenite::Error),
    /// The connection is gone.
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

/// The sync client.
///
/// One instance per document session. Sends are fire-and-forget onto a
/// writer task; inbound frames are decoded by a reader task and pulled
/// with [`SyncClient::recv`].
pub struct SyncClient {
    server_url: String,
    doc_id: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::UnboundedSender<Message>,
    incoming_rx: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
}

impl SyncClient {
    /// Connect to `{server_url}/{doc_id}` and start the session.
    pub async fn connect(
        server_url: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let server_url = server_url.into();
        let doc_id = doc_id.into();
        let url = format!("{server_url}/{doc_id}");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(ClientError::Connect)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Writer task: forward the outgoing channel to the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: decode inbound frames into the incoming channel.
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match protocol::decode_frame(&bytes) {
                            Ok((tag, payload)) => {
                                if in_tx.send((tag, payload.to_vec())).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("dropping undecodable frame from server: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        Ok(Self {
            server_url,
            doc_id,
            state,
            outgoing_tx: out_tx,
            incoming_rx: in_rx,
        })
    }

    /// Encode and send one frame.
    pub fn send(&self, msg_type: MessageType, payload: &[u8]) -> Result<(), ClientError> {
        self.send_raw(protocol::encode_frame(msg_type.tag(), payload))
    }

    /// Send pre-encoded frame bytes verbatim, with no validation.
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(Message::Binary(bytes.into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Next decoded inbound frame; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<(u64, Vec<u8>)> {
        self.incoming_rx.recv().await
    }

    /// Start the close handshake.
    pub fn close(&self) {
        let _ = self.outgoing_tx.send(Message::Close(None));
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Document this client is editing.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Server URL this client dialed.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
