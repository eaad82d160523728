use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    ConnId,
    close::{CloseCode, CloseInfo},
    connection::{
        CloseCallback, CloseNotifier, Connection, ConnectionError, Message, next_connection_id,
    },
    extensions::CompressionContext,
    factory::{ConnectionFactory, Transport},
    options::ServerOptions,
    upgrade::{UpgradeRequest, UpgradeResponse},
};

/// Scriptable in-memory [`Connection`].
pub struct MockConnection {
    id: ConnId,
    remote_address: Option<SocketAddr>,
    notifier: CloseNotifier,
    sent: Mutex<Vec<Message>>,
    closes: Mutex<Vec<(CloseCode, String)>>,
    send_error: Mutex<Option<ConnectionError>>,
    send_delay: Mutex<Option<Duration>>,
    hang_on_close: AtomicBool,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: next_connection_id(),
            remote_address: Some(SocketAddr::from(([127, 0, 0, 1], 40000))),
            notifier: CloseNotifier::new(),
            sent: Mutex::new(vec![]),
            closes: Mutex::new(vec![]),
            send_error: Mutex::new(None),
            send_delay: Mutex::new(None),
            hang_on_close: AtomicBool::new(false),
            incoming_tx: Mutex::new(Some(tx)),
            incoming_rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Every following write fails with `error`.
    pub fn fail_sends(&self, error: ConnectionError) {
        *self.send_error.lock().unwrap() = Some(error);
    }

    /// Every following write sleeps for `delay` before completing.
    pub fn delay_sends(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    /// Every following close never completes.
    pub fn hang_on_close(&self) {
        self.hang_on_close.store(true, Ordering::SeqCst);
    }

    pub fn push_incoming(&self, message: Message) {
        if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
            tx.send(message).unwrap();
        }
    }

    /// Simulates the peer closing the connection.
    pub fn peer_close(&self, code: CloseCode, reason: &str) {
        self.incoming_tx.lock().unwrap().take();
        self.notifier
            .notify(self.id, CloseInfo::new(code, reason, true));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                Message::Text(text) => Some(text),
                Message::Binary(_) => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<(CloseCode, String)> {
        self.closes.lock().unwrap().clone()
    }

    async fn write(&self, message: Message) -> Result<(), ConnectionError> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.notifier.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let error = self.send_error.lock().unwrap().clone();
        if let Some(error) = error {
            return Err(error);
        }

        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_closed()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    fn close_info(&self) -> Option<CloseInfo> {
        self.notifier.info()
    }

    async fn receive(&self) -> Option<Message> {
        self.incoming_rx.lock().await.recv().await
    }

    async fn send_text(&self, data: &str) -> Result<(), ConnectionError> {
        self.write(Message::Text(data.to_string())).await
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.write(Message::Binary(Bytes::copy_from_slice(data)))
            .await
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), ConnectionError> {
        if self.notifier.is_closed() {
            return Ok(());
        }

        self.closes
            .lock()
            .unwrap()
            .push((code, reason.to_string()));

        if self.hang_on_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        self.incoming_tx.lock().unwrap().take();
        self.notifier
            .notify(self.id, CloseInfo::new(code, reason, false));

        Ok(())
    }

    fn on_close(&self, callback: CloseCallback) {
        self.notifier.register(self.id, callback);
    }
}

impl Transport for Arc<MockConnection> {}

/// Factory whose transport already is the connection.
#[derive(Default)]
pub struct MockFactory {
    compression: Mutex<Vec<Option<String>>>,
}

impl MockFactory {
    /// Extension header of the compression context passed to each `create` call.
    pub fn compression(&self) -> Vec<Option<String>> {
        self.compression.lock().unwrap().clone()
    }
}

impl ConnectionFactory<Arc<MockConnection>> for MockFactory {
    fn create(
        &self,
        _request: &UpgradeRequest,
        _response: &UpgradeResponse,
        transport: Arc<MockConnection>,
        compression: Option<Arc<dyn CompressionContext>>,
        _options: &ServerOptions,
    ) -> Arc<dyn Connection> {
        self.compression
            .lock()
            .unwrap()
            .push(compression.map(|context| context.extension_header()));
        transport
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not met within 5 seconds");
}
