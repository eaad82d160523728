//! Building connections from upgraded transports.

use std::{io, net::SocketAddr, sync::Arc};

use crate::{
    connection::Connection,
    extensions::CompressionContext,
    options::ServerOptions,
    upgrade::{UpgradeRequest, UpgradeResponse},
};

/// A byte stream handed over by the HTTP layer after a successful upgrade.
pub trait Transport {
    /// Disables Nagle buffering on the underlying socket.
    ///
    /// # Errors
    ///
    /// * [`io::ErrorKind::Unsupported`] if the transport exposes no socket handle
    /// * Any error from the socket option call
    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Address of the peer, when known.
    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for tokio::net::TcpStream {
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

/// Applies socket tuning to a freshly upgraded transport.
///
/// Failures are ignored: transports such as in-process TLS streams do not expose a socket.
pub fn tune_transport(transport: &impl Transport) {
    if let Err(e) = transport.set_nodelay(true) {
        log::trace!("tune_transport: unable to set TCP_NODELAY: {e:?}");
    }
}

/// Builds a [`Connection`] from an upgraded transport.
///
/// Implementations allocate the connection id (see
/// [`next_connection_id`](crate::next_connection_id)) and attach any frame limits or
/// heartbeat policy from `options`.
pub trait ConnectionFactory<T>: Send + Sync {
    fn create(
        &self,
        request: &UpgradeRequest,
        response: &UpgradeResponse,
        transport: T,
        compression: Option<Arc<dyn CompressionContext>>,
        options: &ServerOptions,
    ) -> Arc<dyn Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InMemoryTransport;

    impl Transport for InMemoryTransport {}

    #[test_log::test]
    fn default_transport_does_not_support_nodelay() {
        let error = InMemoryTransport.set_nodelay(true).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::Unsupported);
        assert_eq!(InMemoryTransport.remote_address(), None);
    }

    #[test_log::test]
    fn tuning_ignores_unsupported_transport() {
        tune_transport(&InMemoryTransport);
    }

    #[test_log::test(tokio::test)]
    async fn tunes_tcp_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(tokio::net::TcpStream::connect(address), async {
            listener.accept().await.unwrap().0
        });
        let client = client.unwrap();

        tune_transport(&server);

        assert!(server.nodelay().unwrap());
        assert_eq!(Transport::remote_address(&server), client.local_addr().ok());
    }
}
