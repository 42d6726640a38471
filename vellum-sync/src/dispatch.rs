//! Frame dispatch: decode → look up → invoke → reply.
//!
//! One [`Dispatcher`] serves one connection and is driven by that
//! connection's task, so frames are observed, decoded and dispatched in
//! strict arrival order. Each handler is awaited before the next frame
//! is taken; ordering is a per-connection guarantee and nothing more —
//! other connections run their own dispatchers on their own tasks.
//!
//! The dispatcher is the fault boundary of the transport:
//!
//! ```text
//! inbound frame
//!       │
//!       ▼
//! decode ── malformed ──► log + drop, connection survives
//!       │
//!       ▼
//! tag → name → handler ── none ──► log + drop, connection survives
//!       │
//!       ▼
//! invoke (await) ── Err / panic ──► log + drop, connection survives
//!       │
//!       ▼
//! Reply? ──► encode ──► Connection::send (no-op once closed)
//! ```
//!
//! Nothing that happens inside a handler may close the connection,
//! reach another connection, or take down the process.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;

use crate::connection::Connection;
use crate::protocol::{self, MessageType};
use crate::registry::HandlerRegistry;

/// Dispatch counters, lock-free on the hot path.
#[derive(Debug, Default)]
pub struct DispatchStats {
    frames_dispatched: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_types: AtomicU64,
    handler_failures: AtomicU64,
    replies_sent: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub frames_dispatched: u64,
    pub malformed_frames: u64,
    pub unknown_types: u64,
    pub handler_failures: u64,
    pub replies_sent: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unknown_types: self.unknown_types.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection dispatcher.
///
/// Owns the session's [`HandlerRegistry`] for its whole lifetime; the
/// registry was sealed before the first frame, so lookups need no
/// locking.
pub struct Dispatcher {
    conn: Arc<Connection>,
    registry: HandlerRegistry,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(conn: Arc<Connection>, registry: HandlerRegistry, stats: Arc<DispatchStats>) -> Self {
        Self { conn, registry, stats }
    }

    /// Connection this dispatcher serves.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Process one inbound frame.
    ///
    /// Never fails: every error class is absorbed here, logged with
    /// connection and message-type context, and counted.
    pub async fn dispatch(&self, frame: &[u8]) {
        let (tag, payload) = match protocol::decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                log::warn!("connection {}: dropping frame: {e}", self.conn.id());
                return;
            }
        };

        let name = match MessageType::from_tag(tag) {
            Some(msg_type) => msg_type.name(),
            None => {
                self.stats.unknown_types.fetch_add(1, Ordering::Relaxed);
                log::debug!("connection {}: handler not defined for tag {tag}", self.conn.id());
                return;
            }
        };

        let handler = match self.registry.lookup(name) {
            Some(handler) => handler,
            None => {
                self.stats.unknown_types.fetch_add(1, Ordering::Relaxed);
                log::debug!("connection {}: handler not defined for {name:?}", self.conn.id());
                return;
            }
        };

        self.stats.frames_dispatched.fetch_add(1, Ordering::Relaxed);

        let invocation = AssertUnwindSafe(handler(payload.to_vec())).catch_unwind();
        match invocation.await {
            Ok(Ok(Some(reply))) => {
                let encoded = protocol::encode_frame(reply.msg_type.tag(), &reply.payload);
                self.conn.send(encoded);
                self.stats.replies_sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("connection {}: {name} handler failed: {e}", self.conn.id());
            }
            Err(_panic) => {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("connection {}: {name} handler panicked", self.conn.id());
            }
        }
    }
}
