//! Connection registry and fan-out messaging.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, PoisonError, RwLock, Weak},
};

use bytes::Bytes;
use futures::future::{BoxFuture, join_all};

use crate::{
    ConnId,
    connection::{Connection, ConnectionError},
    send_queue::{Payload, SendHandle, SendQueue},
};

/// Per-connection results of a fan-out send.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Connections whose write failed, with the failure.
    pub errors: BTreeMap<ConnId, ConnectionError>,
    /// Connections whose write succeeded.
    pub successes: BTreeSet<ConnId>,
}

impl SendOutcome {
    /// Whether every targeted connection was written to.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Resolves once every write of a fan-out send has settled.
pub type SettleFuture = BoxFuture<'static, SendOutcome>;

/// Sends messages to registered connections.
///
/// Every method queues its writes before returning, so for any one connection, messages
/// are written in the order the calls were made, regardless of which method was used.
/// Writes made directly on a [`Connection`] bypass the queue and are not ordered relative
/// to gateway writes.
pub trait Gateway: Send + Sync {
    /// Starts tracking `connection`. It is forgotten automatically once it closes.
    fn add_connection(&self, connection: Arc<dyn Connection>);

    /// Stops tracking a connection, failing its queued writes.
    ///
    /// Returns `false` if the connection was not registered.
    fn remove_connection(&self, id: ConnId) -> bool;

    /// Sends a text message to every connection except those in `exclude`.
    fn broadcast(&self, data: &str, exclude: &[ConnId]) -> SettleFuture;

    /// Sends a binary message to every connection except those in `exclude`.
    fn broadcast_binary(&self, data: Bytes, exclude: &[ConnId]) -> SettleFuture;

    /// Sends a text message to the given connections, skipping unknown ids.
    fn multicast(&self, data: &str, ids: &[ConnId]) -> SettleFuture;

    /// Sends a binary message to the given connections, skipping unknown ids.
    fn multicast_binary(&self, data: Bytes, ids: &[ConnId]) -> SettleFuture;

    /// Sends a text message to one connection.
    ///
    /// The handle resolves to [`ConnectionError::NotFound`] if `id` is not registered.
    fn send(&self, data: &str, id: ConnId) -> SendHandle;

    /// Sends a binary message to one connection.
    ///
    /// The handle resolves to [`ConnectionError::NotFound`] if `id` is not registered.
    fn send_binary(&self, data: Bytes, id: ConnId) -> SendHandle;

    /// Snapshot of the registered connections.
    fn connections(&self) -> BTreeMap<ConnId, Arc<dyn Connection>>;
}

#[derive(Default)]
struct Registry {
    connections: BTreeMap<ConnId, Arc<dyn Connection>>,
    queues: BTreeMap<ConnId, SendQueue>,
}

fn remove_from(registry: &RwLock<Registry>, id: ConnId) -> bool {
    let queue = {
        let mut registry = registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.connections.remove(&id);
        registry.queues.remove(&id)
    };

    let Some(queue) = queue else {
        return false;
    };

    queue.close();
    log::debug!("remove_connection: removed connection #{id}");

    true
}

/// [`Gateway`] backed by an in-memory registry with one [`SendQueue`] per connection.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Default, Clone)]
pub struct ConnectionGateway {
    registry: Arc<RwLock<Registry>>,
}

impl std::fmt::Debug for ConnectionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ConnectionGateway")
            .field("connections", &registry.connections.keys())
            .finish()
    }
}

impl ConnectionGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enqueue_where(&self, payload: &Payload, filter: impl Fn(ConnId) -> bool) -> SettleFuture {
        let handles = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .queues
                .iter()
                .filter(|(id, _)| filter(**id))
                .map(|(id, queue)| (*id, queue.enqueue(payload.clone())))
                .collect::<Vec<_>>()
        };

        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "enqueue_where: queued {} payload for {} connections",
                if payload.is_binary() { "binary" } else { "text" },
                handles.len()
            );
        }

        Box::pin(settle(handles))
    }

    fn enqueue_on(&self, payload: Payload, id: ConnId) -> SendHandle {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.queues.get(&id).map_or_else(
            || SendHandle::ready(Err(ConnectionError::NotFound(id))),
            |queue| queue.enqueue(payload),
        )
    }
}

async fn settle(handles: Vec<(ConnId, SendHandle)>) -> SendOutcome {
    let results = join_all(
        handles
            .into_iter()
            .map(|(id, handle)| async move { (id, handle.await) }),
    )
    .await;

    let mut outcome = SendOutcome::default();
    for (id, result) in results {
        match result {
            Ok(()) => {
                outcome.successes.insert(id);
            }
            Err(e) => {
                outcome.errors.insert(id, e);
            }
        }
    }
    outcome
}

impl Gateway for ConnectionGateway {
    fn add_connection(&self, connection: Arc<dyn Connection>) {
        let id = connection.id();
        let queue = SendQueue::new(connection.clone());

        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.connections.insert(id, connection.clone());
            registry.queues.insert(id, queue);
        }

        log::debug!("add_connection: registered connection #{id}");

        let registry: Weak<RwLock<Registry>> = Arc::downgrade(&self.registry);
        connection.on_close(Box::new(move |id, _info| {
            if let Some(registry) = registry.upgrade() {
                remove_from(&registry, id);
            }
        }));
    }

    fn remove_connection(&self, id: ConnId) -> bool {
        remove_from(&self.registry, id)
    }

    fn broadcast(&self, data: &str, exclude: &[ConnId]) -> SettleFuture {
        self.enqueue_where(&Payload::from(data), |id| !exclude.contains(&id))
    }

    fn broadcast_binary(&self, data: Bytes, exclude: &[ConnId]) -> SettleFuture {
        self.enqueue_where(&Payload::Binary(data), |id| !exclude.contains(&id))
    }

    fn multicast(&self, data: &str, ids: &[ConnId]) -> SettleFuture {
        self.enqueue_where(&Payload::from(data), |id| ids.contains(&id))
    }

    fn multicast_binary(&self, data: Bytes, ids: &[ConnId]) -> SettleFuture {
        self.enqueue_where(&Payload::Binary(data), |id| ids.contains(&id))
    }

    fn send(&self, data: &str, id: ConnId) -> SendHandle {
        self.enqueue_on(Payload::from(data), id)
    }

    fn send_binary(&self, data: Bytes, id: ConnId) -> SendHandle {
        self.enqueue_on(Payload::Binary(data), id)
    }

    fn connections(&self) -> BTreeMap<ConnId, Arc<dyn Connection>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{close::CloseCode, connection::Message, test_utils::MockConnection};

    fn gateway_with(count: usize) -> (ConnectionGateway, Vec<Arc<MockConnection>>) {
        let gateway = ConnectionGateway::new();
        let connections = (0..count).map(|_| MockConnection::new()).collect::<Vec<_>>();
        for connection in &connections {
            gateway.add_connection(connection.clone());
        }
        (gateway, connections)
    }

    #[test_log::test(tokio::test)]
    async fn preserves_order_across_gateway_paths() {
        let (gateway, connections) = gateway_with(2);
        let slow = &connections[0];
        let fast = &connections[1];
        slow.delay_sends(Duration::from_millis(5));

        let first = gateway.broadcast("1", &[]);
        let second = gateway.send("2", slow.id());
        let second_fast = gateway.send("2", fast.id());
        let third = gateway.multicast("3", &[slow.id(), fast.id()]);
        let fourth = gateway.broadcast("4", &[]);
        let fifth = gateway.send("5", slow.id());
        let fifth_fast = gateway.send("5", fast.id());

        assert!(first.await.is_success());
        second.await.unwrap();
        second_fast.await.unwrap();
        assert!(third.await.is_success());
        assert!(fourth.await.is_success());
        fifth.await.unwrap();
        fifth_fast.await.unwrap();

        for connection in &connections {
            assert_eq!(connection.sent_texts(), vec!["1", "2", "3", "4", "5"]);
        }
    }

    #[test_log::test(tokio::test)]
    async fn broadcast_skips_excluded_connections() {
        let (gateway, connections) = gateway_with(3);
        let excluded = connections[1].id();

        let outcome = gateway.broadcast("hello", &[excluded]).await;

        assert_eq!(
            outcome.successes,
            BTreeSet::from([connections[0].id(), connections[2].id()])
        );
        assert!(outcome.errors.is_empty());
        assert!(connections[1].sent().is_empty());
        assert_eq!(connections[2].sent_texts(), vec!["hello"]);
    }

    #[test_log::test(tokio::test)]
    async fn broadcast_binary_reaches_every_connection() {
        let (gateway, connections) = gateway_with(2);

        let outcome = gateway
            .broadcast_binary(Bytes::from_static(&[1, 2, 3]), &[])
            .await;

        assert_eq!(outcome.successes.len(), 2);
        for connection in &connections {
            assert_eq!(
                connection.sent(),
                vec![Message::Binary(Bytes::from_static(&[1, 2, 3]))]
            );
        }
    }

    #[test_log::test(tokio::test)]
    async fn multicast_skips_unknown_ids() {
        let (gateway, connections) = gateway_with(2);
        let target = connections[0].id();

        let outcome = gateway.multicast("hi", &[target, 999_999_999]).await;

        assert_eq!(outcome.successes, BTreeSet::from([target]));
        assert!(outcome.errors.is_empty());
        assert!(connections[1].sent().is_empty());

        let outcome = gateway
            .multicast_binary(Bytes::from_static(b"bin"), &[999_999_999])
            .await;
        assert_eq!(outcome, SendOutcome::default());
    }

    #[test_log::test(tokio::test)]
    async fn partial_failure_does_not_abort_other_sends() {
        let (gateway, connections) = gateway_with(3);
        let broken = &connections[1];
        broken.fail_sends(ConnectionError::Io("reset".to_string()));

        let outcome = gateway.broadcast("data", &[]).await;

        assert_eq!(
            outcome.errors,
            BTreeMap::from([(broken.id(), ConnectionError::Io("reset".to_string()))])
        );
        assert_eq!(
            outcome.successes,
            BTreeSet::from([connections[0].id(), connections[2].id()])
        );
        assert!(!outcome.is_success());
    }

    #[test_log::test(tokio::test)]
    async fn send_to_unknown_id_fails() {
        let gateway = ConnectionGateway::new();

        assert_eq!(
            gateway.send("hi", 42).await,
            Err(ConnectionError::NotFound(42))
        );
        assert_eq!(
            gateway.send_binary(Bytes::new(), 42).await,
            Err(ConnectionError::NotFound(42))
        );
    }

    #[test_log::test(tokio::test)]
    async fn forgets_connection_on_close() {
        let (gateway, connections) = gateway_with(2);
        let closing = &connections[0];

        closing.peer_close(CloseCode::GoingAway, "bye");

        assert_eq!(
            gateway.connections().keys().copied().collect::<Vec<_>>(),
            vec![connections[1].id()]
        );
        assert!(!gateway.remove_connection(closing.id()));
        assert_eq!(
            gateway.send("late", closing.id()).await,
            Err(ConnectionError::NotFound(closing.id()))
        );
    }

    #[test_log::test(tokio::test)]
    async fn remove_connection_is_idempotent() {
        let (gateway, connections) = gateway_with(1);
        let id = connections[0].id();

        assert!(gateway.remove_connection(id));
        assert!(!gateway.remove_connection(id));

        connections[0].peer_close(CloseCode::Normal, "");
        assert!(gateway.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn already_closed_connection_is_not_kept() {
        let gateway = ConnectionGateway::new();
        let connection = MockConnection::new();
        connection.peer_close(CloseCode::Normal, "");

        gateway.add_connection(connection);

        assert!(gateway.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn clones_share_registry() {
        let gateway = ConnectionGateway::new();
        let clone = gateway.clone();

        clone.add_connection(MockConnection::new());

        assert_eq!(gateway.len(), 1);
    }
}
