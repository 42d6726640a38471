//! Per-socket session state: identity, lifecycle, outbound queue.
//!
//! A [`Connection`] is the server-side handle for one client session.
//! The transport server creates it at handshake time and destroys it
//! when the socket closes; everything in between — handler replies,
//! collaborator pushes, explicit closes — goes through the handle.
//!
//! Lifecycle only ever moves forward:
//! ```text
//! Connecting ──► Open ──► Closing ──► Closed
//! ```
//! Once the state has left `Open`, [`Connection::send`] is a silent
//! no-op: a peer that is already gone must not be able to fail a
//! handler that finishes late.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Connection lifecycle. Ordered; transitions are monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Outbound instruction consumed by the connection task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Pre-encoded frame to write to the socket.
    Frame(Vec<u8>),
    /// Perform the close handshake and end the session.
    Shutdown,
}

/// One client's live session.
///
/// Cheap to share (`Arc`); all methods take `&self` and are safe to
/// call from any task. The document association is fixed at handshake
/// time and never changes.
pub struct Connection {
    id: Uuid,
    doc_id: String,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<Outgoing>,
}

impl Connection {
    pub(crate) fn new(doc_id: String, outbound: mpsc::UnboundedSender<Outgoing>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            doc_id,
            state: AtomicU8::new(LifecycleState::Connecting as u8),
            outbound,
        })
    }

    /// Opaque connection id, unique per accepted socket.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Document this session is editing, from the connect handshake.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether frames can currently be sent.
    pub fn is_open(&self) -> bool {
        self.state() == LifecycleState::Open
    }

    /// Queue a pre-encoded frame for delivery.
    ///
    /// Silent no-op unless the connection is `Open`; never fails and
    /// never blocks. Delivery order matches call order.
    pub fn send(&self, frame: Vec<u8>) {
        if !self.is_open() {
            log::trace!("connection {}: dropping send, state {:?}", self.id, self.state());
            return;
        }
        // A missing receiver means the connection task already exited;
        // the frame is dropped.
        let _ = self.outbound.send(Outgoing::Frame(frame));
    }

    /// Close the connection.
    ///
    /// Advances to `Closing` and signals the connection task to run the
    /// WebSocket close handshake; the task marks the session `Closed`
    /// when the socket is released. Repeated calls are no-ops.
    pub fn close(&self) {
        let prev = self
            .state
            .fetch_max(LifecycleState::Closing as u8, Ordering::AcqRel);
        if prev >= LifecycleState::Closing as u8 {
            return;
        }
        let _ = self.outbound.send(Outgoing::Shutdown);
    }

    /// Move the lifecycle forward. Backward transitions are ignored.
    pub(crate) fn advance(&self, state: LifecycleState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("doc_id", &self.doc_id)
            .field("state", &self.state())
            .finish()
    }
}
