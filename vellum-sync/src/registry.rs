//! Per-connection message handler registry.
//!
//! The collaborator that owns message semantics (CRDT merge, awareness,
//! document lookup) registers one asynchronous callback per message
//! type inside its connect hook, before the first frame of the session
//! is read. After that the registry is immutable: no removal, no
//! replacement, lifetime equal to the connection's.
//!
//! Type names are unique per registry. A duplicate registration is a
//! programming error in session setup and fails the whole session
//! rather than silently shadowing a handler.

use std::collections::HashMap;
use std::future::Future;

use futures_util::future::BoxFuture;

use crate::protocol::MessageType;

/// Error surfaced through a handler's asynchronous result.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one handler invocation.
pub type HandlerResult = Result<Option<Reply>, HandlerError>;

/// Type-erased handler callback.
///
/// Receives the frame payload (the bytes after the type tag) and may
/// produce a [`Reply`] for the same connection.
pub type Handler = Box<dyn Fn(Vec<u8>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Response produced by a handler.
///
/// The dispatcher encodes it through the frame codec; handlers never
/// hand back pre-encoded wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }
}

/// Registry construction errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already registered under this message-type name.
    DuplicateHandler(&'static str),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateHandler(name) => {
                write!(f, "handler already registered for {name:?}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Message-type-name → handler map for one connection.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under the canonical name of `msg_type`.
    ///
    /// Fails with [`RegistryError::DuplicateHandler`] if the name is
    /// taken — callers should treat that as fatal to session setup.
    pub fn register<F, Fut>(&mut self, msg_type: MessageType, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = msg_type.name();
        if self.handlers.contains_key(name) {
            return Err(RegistryError::DuplicateHandler(name));
        }
        self.handlers
            .insert(name, Box::new(move |payload| Box::pin(handler(payload))));
        Ok(())
    }

    /// Look up the handler registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}
