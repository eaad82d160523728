//! The connection abstraction consumed by this crate.
//!
//! A [`Connection`] is produced by a frame codec that already speaks the websocket wire
//! format. This crate never parses frames itself; it only drives the connection lifecycle
//! and orders writes on top of it.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    ConnId,
    close::{CloseCode, CloseInfo},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique connection id.
///
/// Ids are never reused for the lifetime of the process.
#[must_use]
pub fn next_connection_id() -> ConnId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A complete message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A UTF-8 text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

impl Message {
    /// The message payload as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// Errors raised by connection operations.
///
/// The error is `Clone` so that one write failure can be reported to every write
/// queued behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The connection is closed or closing.
    #[error("Connection closed")]
    Closed,
    /// No connection with this id is registered.
    #[error("Connection {0} not found")]
    NotFound(ConnId),
    /// The underlying transport failed.
    #[error("IO error: {0}")]
    Io(String),
    /// The codec rejected the operation.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Callback invoked once with the connection id and close metadata when a connection closes.
pub type CloseCallback = Box<dyn FnOnce(ConnId, &CloseInfo) + Send>;

/// A live websocket connection.
///
/// Implementations must invoke every callback registered with [`Connection::on_close`] at
/// most once, regardless of whether the close was local, peer-initiated or caused by an
/// error. [`CloseNotifier`] implements that bookkeeping.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The process-unique id of this connection.
    fn id(&self) -> ConnId;

    /// Whether the connection is closed or closing.
    fn is_closed(&self) -> bool;

    /// Address of the peer, when the transport knows it.
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Close metadata, available once the connection has closed.
    fn close_info(&self) -> Option<CloseInfo>;

    /// Receives the next message, or `None` once the connection is closed.
    async fn receive(&self) -> Option<Message>;

    /// Writes a text message.
    ///
    /// # Errors
    ///
    /// * [`ConnectionError::Closed`] if the connection has closed
    /// * Any transport error raised by the codec
    async fn send_text(&self, data: &str) -> Result<(), ConnectionError>;

    /// Writes a binary message.
    ///
    /// # Errors
    ///
    /// * [`ConnectionError::Closed`] if the connection has closed
    /// * Any transport error raised by the codec
    async fn send_binary(&self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Closes the connection with the given code and reason.
    ///
    /// # Errors
    ///
    /// * If the close frame could not be written
    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), ConnectionError>;

    /// Registers a callback to run when the connection closes.
    ///
    /// If the connection is already closed the callback runs immediately.
    fn on_close(&self, callback: CloseCallback);
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Connection #{}}}", self.id())
    }
}

#[derive(Default)]
struct NotifierState {
    info: Option<CloseInfo>,
    callbacks: Vec<CloseCallback>,
}

/// Close bookkeeping for [`Connection`] implementations.
///
/// Records the close metadata the first time [`CloseNotifier::notify`] is called and runs
/// the registered callbacks exactly once. Later notifications are ignored.
#[derive(Default)]
pub struct CloseNotifier {
    state: Mutex<NotifierState>,
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("CloseNotifier")
            .field("info", &state.info)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

impl CloseNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback, running it immediately if the close already happened.
    pub fn register(&self, id: ConnId, callback: CloseCallback) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(info) = state.info.clone() {
            drop(state);
            callback(id, &info);
        } else {
            state.callbacks.push(callback);
        }
    }

    /// Records the close and runs every registered callback.
    ///
    /// Returns `false` if the connection had already been marked closed, in which case no
    /// callback runs.
    pub fn notify(&self, id: ConnId, info: CloseInfo) -> bool {
        let callbacks = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.info.is_some() {
                return false;
            }
            state.info = Some(info.clone());
            std::mem::take(&mut state.callbacks)
        };

        log::trace!(
            "notify: connection #{id} closed code={} by_peer={} callbacks={}",
            info.code,
            info.by_peer,
            callbacks.len()
        );

        for callback in callbacks {
            callback(id, &info);
        }

        true
    }

    #[must_use]
    pub fn info(&self) -> Option<CloseInfo> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .info
            .clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .info
            .is_some()
    }
}
