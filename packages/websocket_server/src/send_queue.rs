//! Per-connection ordered, non-blocking writes.
//!
//! A [`SendQueue`] owns a consumer task that writes queued payloads to its connection one
//! at a time, in enqueue order. Callers get a [`SendHandle`] back immediately and may await
//! it to learn the outcome of their write.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use strum_macros::AsRefStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionError};

/// A message waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Arc<str>),
    Binary(Bytes),
}

impl Payload {
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(Arc::from(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(Arc::from(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

type SendResult = Result<(), ConnectionError>;

/// Resolves once the payload it was returned for has been written or has failed.
///
/// Dropping the handle does not cancel the write.
#[derive(Debug)]
pub struct SendHandle {
    inner: SendHandleInner,
}

#[derive(Debug)]
enum SendHandleInner {
    Ready(Option<SendResult>),
    Pending(oneshot::Receiver<SendResult>),
}

impl SendHandle {
    /// A handle that is already resolved.
    #[must_use]
    pub const fn ready(result: SendResult) -> Self {
        Self {
            inner: SendHandleInner::Ready(Some(result)),
        }
    }

    const fn pending(rx: oneshot::Receiver<SendResult>) -> Self {
        Self {
            inner: SendHandleInner::Pending(rx),
        }
    }
}

impl Future for SendHandle {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            SendHandleInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(ConnectionError::Closed)))
            }
            // A dropped sender means the consumer went away without reporting.
            SendHandleInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(ConnectionError::Closed))),
        }
    }
}

/// Observable state of a [`SendQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum SendQueueState {
    /// Nothing queued, the consumer is waiting for work.
    Idle,
    /// The consumer is writing queued payloads.
    Draining,
    /// The consumer has stopped. Nothing more will be written.
    Closed,
}

struct QueuedSend {
    payload: Payload,
    completion: oneshot::Sender<SendResult>,
}

#[derive(Default)]
struct QueueStatus {
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// Ordered write queue for a single connection.
///
/// Writes happen on a dedicated tokio task, so creating a queue requires a running tokio
/// runtime. The first failed write closes the queue and fails everything queued behind it
/// with the same error. Dropping the queue closes it.
pub struct SendQueue {
    connection_id: crate::ConnId,
    tx: mpsc::UnboundedSender<QueuedSend>,
    status: Arc<QueueStatus>,
    token: CancellationToken,
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SendQueue {
    /// Creates the queue and spawns its consumer task.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(QueueStatus::default());
        let token = CancellationToken::new();
        let connection_id = connection.id();

        tokio::spawn(consume(connection, rx, status.clone(), token.clone()));

        Self {
            connection_id,
            tx,
            status,
            token,
        }
    }

    /// Queues `payload` behind every payload queued before it.
    ///
    /// Never waits. If the queue is already closed the returned handle resolves to
    /// [`ConnectionError::Closed`].
    pub fn enqueue(&self, payload: impl Into<Payload>) -> SendHandle {
        if self.status.closed.load(Ordering::SeqCst) {
            return SendHandle::ready(Err(ConnectionError::Closed));
        }

        let (completion, rx) = oneshot::channel();

        self.status.pending.fetch_add(1, Ordering::SeqCst);

        if self
            .tx
            .send(QueuedSend {
                payload: payload.into(),
                completion,
            })
            .is_err()
        {
            self.status.pending.fetch_sub(1, Ordering::SeqCst);
            return SendHandle::ready(Err(ConnectionError::Closed));
        }

        SendHandle::pending(rx)
    }

    /// Stops the consumer. Queued and in-flight writes fail with [`ConnectionError::Closed`].
    pub fn close(&self) {
        if !self.status.closed.swap(true, Ordering::SeqCst) {
            log::trace!("SendQueue: closing queue for connection #{}", self.connection_id);
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn state(&self) -> SendQueueState {
        if self.status.closed.load(Ordering::SeqCst) {
            SendQueueState::Closed
        } else if self.status.pending.load(Ordering::SeqCst) > 0 {
            SendQueueState::Draining
        } else {
            SendQueueState::Idle
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SendQueueState::Closed
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write(connection: &dyn Connection, payload: &Payload) -> SendResult {
    match payload {
        Payload::Text(text) => connection.send_text(text).await,
        Payload::Binary(bytes) => connection.send_binary(bytes).await,
    }
}

async fn consume(
    connection: Arc<dyn Connection>,
    mut rx: mpsc::UnboundedReceiver<QueuedSend>,
    status: Arc<QueueStatus>,
    token: CancellationToken,
) {
    let id = connection.id();
    log::trace!("consume: starting send queue for connection #{id}");

    let error = loop {
        let queued = tokio::select! {
            () = token.cancelled() => break ConnectionError::Closed,
            queued = rx.recv() => match queued {
                Some(queued) => queued,
                None => break ConnectionError::Closed,
            },
        };

        let result = if connection.is_closed() {
            Err(ConnectionError::Closed)
        } else {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(ConnectionError::Closed),
                result = write(connection.as_ref(), &queued.payload) => result,
            }
        };

        status.pending.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let _ = queued.completion.send(Ok(()));
            }
            Err(e) => {
                log::debug!("consume: write to connection #{id} failed: {e}");
                let _ = queued.completion.send(Err(e.clone()));
                break e;
            }
        }
    };

    status.closed.store(true, Ordering::SeqCst);
    rx.close();

    let mut failed = 0_usize;
    while let Ok(queued) = rx.try_recv() {
        status.pending.fetch_sub(1, Ordering::SeqCst);
        let _ = queued.completion.send(Err(error.clone()));
        failed += 1;
    }

    log::trace!("consume: send queue for connection #{id} closed ({failed} queued writes failed)");
}
