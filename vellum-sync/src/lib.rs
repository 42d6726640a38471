//! # vellum-sync — Real-time sync transport for Vellum
//!
//! WebSocket transport and dispatch layer for collaborative document
//! editing. Clients hold one persistent connection per document and
//! exchange small binary frames carrying CRDT synchronization state;
//! this crate owns the socket lifecycle, the wire framing and the
//! routing of decoded frames to per-message handlers, and stays
//! agnostic to what those handlers do.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   WebSocket    ┌──────────────┐
//! │ SyncClient │ ◄─────────────► │  SyncServer  │
//! │ (per user) │  binary frames │ (accept loop) │
//! └────────────┘                └──────┬───────┘
//!                                      │ one task per connection
//!                               ┌──────┴───────┐
//!                               │  Connection   │──► lifecycle, sends
//!                               ├──────────────┤
//!                               │  Dispatcher   │──► decode → lookup → invoke
//!                               ├──────────────┤
//!                               │HandlerRegistry│──► collaborator callbacks
//!                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary frame codec (varint type tag + opaque payload)
//! - [`connection`] — per-socket session handle and lifecycle
//! - [`registry`] — per-connection handler registry
//! - [`dispatch`] — ordered dispatch loop with fault isolation
//! - [`server`] — WebSocket transport server and session hooks
//! - [`client`] — frame-level sync client
//!
//! ## Guarantees
//!
//! | Property | Scope |
//! |----------|-------|
//! | FIFO decode-and-dispatch | per connection |
//! | Handler faults absorbed  | per frame |
//! | Malformed/unknown frames dropped | connection survives |
//! | Sends after close | silent no-op |

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use client::{ClientError, ConnectionState, SyncClient};
pub use connection::{Connection, LifecycleState};
pub use dispatch::{DispatchSnapshot, DispatchStats, Dispatcher};
pub use protocol::{
    decode_frame, encode_frame, MessageType, ProtocolError, MAX_VARINT_LEN,
};
pub use registry::{
    Handler, HandlerError, HandlerRegistry, HandlerResult, RegistryError, Reply,
};
pub use server::{
    Handshake, ServerConfig, ServerStats, SessionError, SessionHooks, ShutdownMode,
    SyncServer, TransportError,
};
