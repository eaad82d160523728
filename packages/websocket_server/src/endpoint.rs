//! Per-request orchestration of the websocket lifecycle.
//!
//! An [`Endpoint`] validates the handshake, negotiates extensions, builds the connection
//! once the HTTP layer hands over the transport, registers it with the [`Gateway`] and runs
//! the application's [`ConnectionHandler`] on its own task. It also closes every
//! connection it tracks when the server shuts down.

use std::{
    any::Any,
    collections::BTreeMap,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use futures::{FutureExt as _, future::join_all};
use http::{StatusCode, header};
use thiserror::Error;

use crate::{
    ConnId,
    close::{CloseCode, CloseInfo},
    connection::{Connection, ConnectionError},
    extensions::{CompressionContext, DeflateNegotiator, ExtensionNegotiator, negotiate_extensions},
    factory::{ConnectionFactory, Transport, tune_transport},
    gateway::{ConnectionGateway, Gateway},
    handshake::{HandshakeAcceptor, Rfc6455Acceptor, rejection},
    options::ServerOptions,
    upgrade::{PlainTextErrorHandler, UpgradeErrorHandler, UpgradeRequest, UpgradeResponse},
};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Application logic run once per upgraded connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Runs for the lifetime of the connection, typically looping over
    /// [`Connection::receive`] until it returns `None`.
    ///
    /// If this returns `Ok` while the connection is still open, the connection is closed
    /// normally. Any error closes it with [`CloseCode::UnexpectedServerError`].
    ///
    /// # Errors
    ///
    /// * Any error the application wants logged
    async fn handle_connection(
        &self,
        connection: Arc<dyn Connection>,
        request: &UpgradeRequest,
        response: &UpgradeResponse,
    ) -> Result<(), HandlerError>;

    /// Name used when logging handler failures.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Every observer failure from a single start or stop.
#[derive(Debug, Error)]
#[error("{} server observer(s) failed: {:?}", .errors.len(), .errors)]
pub struct LifecycleError {
    pub errors: Vec<ObserverError>,
}

/// Notified when the server hosting an [`Endpoint`] starts and stops.
#[async_trait]
pub trait ServerObserver: Send + Sync {
    /// # Errors
    ///
    /// * If the observer failed to start
    async fn on_start(&self) -> Result<(), ObserverError>;

    /// # Errors
    ///
    /// * If the observer failed to stop cleanly
    async fn on_stop(&self) -> Result<(), ObserverError>;
}

/// Outcome of [`Endpoint::handle_request`].
#[derive(Debug)]
pub enum EndpointResponse<T> {
    /// The request was not upgraded. Send this response and end the exchange.
    Reject(UpgradeResponse),
    /// The request was accepted. Send [`PendingUpgrade::response`], then hand the
    /// upgraded transport to [`PendingUpgrade::upgrade`].
    Upgrade(PendingUpgrade<T>),
}

/// An accepted handshake waiting for the HTTP layer to hand over the transport.
pub struct PendingUpgrade<T> {
    endpoint: Arc<Endpoint<T>>,
    request: UpgradeRequest,
    response: UpgradeResponse,
    compression: Option<Arc<dyn CompressionContext>>,
}

impl<T> std::fmt::Debug for PendingUpgrade<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingUpgrade")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> PendingUpgrade<T> {
    #[must_use]
    pub const fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    /// The `101 Switching Protocols` response to send before upgrading.
    #[must_use]
    pub const fn response(&self) -> &UpgradeResponse {
        &self.response
    }

    #[must_use]
    pub fn compression(&self) -> Option<&Arc<dyn CompressionContext>> {
        self.compression.as_ref()
    }

    /// Builds the connection over `transport`, registers it and spawns the handler task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn upgrade(self, transport: T) -> Arc<dyn Connection> {
        let Self {
            endpoint,
            request,
            response,
            compression,
        } = self;

        tune_transport(&transport);
        let address = transport.remote_address().or_else(|| request.remote_address());

        let connection = endpoint.factory.create(
            &request,
            &response,
            transport,
            compression,
            &endpoint.options,
        );

        log::debug!(
            "Upgraded {} to websocket connection #{}",
            address.map_or_else(|| "unknown address".to_string(), |x| x.to_string()),
            connection.id()
        );

        endpoint.track(&connection);
        endpoint.gateway.add_connection(connection.clone());

        tokio::spawn(run_handler(
            endpoint.handler.clone(),
            connection.clone(),
            request,
            response,
        ));

        connection
    }

    /// Abandons the upgrade after the HTTP layer could not carry it out, building the
    /// rejection with the endpoint's [`UpgradeErrorHandler`].
    ///
    /// Nothing has been registered yet, so no connection is created or closed.
    #[must_use]
    pub fn reject(
        self,
        status: StatusCode,
        reason: Option<&str>,
        header: Option<(header::HeaderName, &'static str)>,
    ) -> UpgradeResponse {
        rejection(
            self.endpoint.error_handler.as_ref(),
            &self.request,
            status,
            reason,
            header,
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn run_handler(
    handler: Arc<dyn ConnectionHandler>,
    connection: Arc<dyn Connection>,
    request: UpgradeRequest,
    response: UpgradeResponse,
) {
    let id = connection.id();

    let result = AssertUnwindSafe(handler.handle_connection(
        connection.clone(),
        &request,
        &response,
    ))
    .catch_unwind()
    .await
    .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

    let (code, reason) = match result {
        Ok(()) => {
            if connection.is_closed() {
                return;
            }
            (CloseCode::Normal, "Closing connection")
        }
        Err(HandlerError::Connection(ConnectionError::Closed)) if connection.is_closed() => {
            log::trace!("run_handler: connection #{id} closed while handler was running");
            return;
        }
        Err(e) => {
            log::error!(
                "Unexpected error in websocket handler {} for connection #{id} ({}): {e}",
                handler.name(),
                connection
                    .remote_address()
                    .map_or_else(|| "unknown address".to_string(), |x| x.to_string()),
            );
            (
                CloseCode::UnexpectedServerError,
                "Internal server error, aborting",
            )
        }
    };

    if let Err(e) = connection.close(code, reason).await {
        log::debug!("run_handler: failed to close connection #{id}: {e}");
    }
}

/// Peer-initiated closes reporting an error on our side are logged at warn.
const fn is_reported_close(info: &CloseInfo) -> bool {
    info.by_peer && info.code.is_peer_error()
}

fn log_close(id: ConnId, info: &CloseInfo) {
    if is_reported_close(info) {
        log::warn!(
            "Client initiated websocket close reporting error (code: {}): {}",
            u16::from(info.code),
            info.reason
        );
    } else {
        log::debug!(
            "Websocket connection #{id} closed: {} {:?} by_peer={}",
            info.code,
            info.reason,
            info.by_peer
        );
    }
}

type Clients = Arc<RwLock<BTreeMap<ConnId, Arc<dyn Connection>>>>;

/// Upgrades websocket requests and manages the resulting connections.
pub struct Endpoint<T> {
    acceptor: Arc<dyn HandshakeAcceptor>,
    error_handler: Arc<dyn UpgradeErrorHandler>,
    negotiator: Option<Arc<dyn ExtensionNegotiator>>,
    factory: Arc<dyn ConnectionFactory<T>>,
    handler: Arc<dyn ConnectionHandler>,
    gateway: Arc<dyn Gateway>,
    options: ServerOptions,
    observers: RwLock<Vec<Arc<dyn ServerObserver>>>,
    clients: Clients,
}

impl<T> std::fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("handler", &self.handler.name())
            .field("options", &self.options)
            .field("connections", &self.connections().len())
            .finish_non_exhaustive()
    }
}

impl<T> Endpoint<T> {
    #[must_use]
    pub fn builder(
        handler: Arc<dyn ConnectionHandler>,
        factory: Arc<dyn ConnectionFactory<T>>,
    ) -> EndpointBuilder<T> {
        EndpointBuilder::new(handler, factory)
    }

    /// Runs the handshake and, on success, the extension negotiation for `request`.
    #[must_use]
    pub fn handle_request(self: &Arc<Self>, request: UpgradeRequest) -> EndpointResponse<T> {
        let mut response = self.acceptor.accept(&request);

        if !response.is_switching_protocols() {
            if response.headers().contains_key(header::SEC_WEBSOCKET_ACCEPT) {
                response.remove_header(header::CONNECTION);
                response.remove_header(header::UPGRADE);
                response.remove_header(header::SEC_WEBSOCKET_ACCEPT);
            }
            return EndpointResponse::Reject(response);
        }

        let compression = if self.options.compression_enabled() {
            self.negotiator
                .as_ref()
                .and_then(|negotiator| {
                    negotiate_extensions(negotiator.as_ref(), &request, &mut response)
                })
        } else {
            None
        };

        EndpointResponse::Upgrade(PendingUpgrade {
            endpoint: self.clone(),
            request,
            response,
            compression,
        })
    }

    #[must_use]
    pub const fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    #[must_use]
    pub const fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Snapshot of the connections upgraded by this endpoint that are still open.
    #[must_use]
    pub fn connections(&self) -> BTreeMap<ConnId, Arc<dyn Connection>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attach(&self, observer: Arc<dyn ServerObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn ServerObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn track(&self, connection: &Arc<dyn Connection>) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.id(), connection.clone());

        let clients = Arc::downgrade(&self.clients);
        connection.on_close(Box::new(move |id, info| {
            if let Some(clients) = clients.upgrade() {
                clients
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
            log_close(id, info);
        }));
    }

    /// Notifies every attached observer that the server started.
    ///
    /// # Errors
    ///
    /// * [`LifecycleError`] listing every observer that failed to start
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let observers = self.observers();
        log::debug!("start: starting {} observers", observers.len());

        let results = join_all(observers.iter().map(|observer| observer.on_start())).await;

        collect_errors(results)
    }

    /// Notifies every attached observer that the server is stopping, then shuts down.
    ///
    /// # Errors
    ///
    /// * [`LifecycleError`] listing every observer that failed to stop
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let observers = self.observers();
        log::debug!("stop: stopping {} observers", observers.len());

        let results = join_all(observers.iter().map(|observer| observer.on_stop())).await;

        self.shutdown().await;

        collect_errors(results)
    }

    /// Closes every open connection with [`CloseCode::GoingAway`] and forgets them.
    ///
    /// Each close runs on its own task. Waits at most
    /// [`ServerOptions::shutdown_timeout`] for them before returning. Close failures are
    /// ignored.
    pub async fn shutdown(&self) {
        let clients = std::mem::take(
            &mut *self
                .clients
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );

        log::debug!("shutdown: closing {} connections", clients.len());

        let ids = clients.keys().copied().collect::<Vec<_>>();
        let closes = clients
            .into_values()
            .map(|connection| {
                tokio::spawn(async move {
                    if let Err(e) = connection
                        .close(CloseCode::GoingAway, "Server shutting down!")
                        .await
                    {
                        log::trace!(
                            "shutdown: failed to close connection #{}: {e}",
                            connection.id()
                        );
                    }
                })
            })
            .collect::<Vec<_>>();

        if tokio::time::timeout(self.options.shutdown_timeout(), join_all(closes))
            .await
            .is_err()
        {
            log::warn!(
                "shutdown: connections did not close within {:?}",
                self.options.shutdown_timeout()
            );
        }

        for id in ids {
            self.gateway.remove_connection(id);
        }

        log::debug!("shutdown: finished");
    }
}

fn collect_errors(results: Vec<Result<(), ObserverError>>) -> Result<(), LifecycleError> {
    let errors = results
        .into_iter()
        .filter_map(Result::err)
        .collect::<Vec<_>>();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(LifecycleError { errors })
    }
}

/// Configures an [`Endpoint`].
///
/// Defaults: [`Rfc6455Acceptor`], [`PlainTextErrorHandler`], [`DeflateNegotiator`], a
/// fresh [`ConnectionGateway`] and [`ServerOptions::default`].
pub struct EndpointBuilder<T> {
    handler: Arc<dyn ConnectionHandler>,
    factory: Arc<dyn ConnectionFactory<T>>,
    acceptor: Option<Arc<dyn HandshakeAcceptor>>,
    error_handler: Option<Arc<dyn UpgradeErrorHandler>>,
    negotiator: Option<Arc<dyn ExtensionNegotiator>>,
    gateway: Option<Arc<dyn Gateway>>,
    options: Option<ServerOptions>,
    observers: Vec<Arc<dyn ServerObserver>>,
}

impl<T> EndpointBuilder<T> {
    #[must_use]
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        factory: Arc<dyn ConnectionFactory<T>>,
    ) -> Self {
        Self {
            handler,
            factory,
            acceptor: None,
            error_handler: None,
            negotiator: Some(Arc::new(DeflateNegotiator::default())),
            gateway: None,
            options: None,
            observers: vec![],
        }
    }

    #[must_use]
    pub fn with_acceptor(mut self, acceptor: Arc<dyn HandshakeAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Builds the rejections of [`PendingUpgrade::reject`]. The acceptor keeps its own
    /// error handler for handshake rejections.
    #[must_use]
    pub fn with_error_handler(mut self, error_handler: Arc<dyn UpgradeErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Replaces the extension negotiator. `None` disables extension negotiation.
    #[must_use]
    pub fn with_negotiator(mut self, negotiator: Option<Arc<dyn ExtensionNegotiator>>) -> Self {
        self.negotiator = negotiator;
        self
    }

    #[must_use]
    pub fn with_gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = Some(options);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ServerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Endpoint<T>> {
        Arc::new(Endpoint {
            acceptor: self
                .acceptor
                .unwrap_or_else(|| Arc::new(Rfc6455Acceptor::default())),
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Arc::new(PlainTextErrorHandler)),
            negotiator: self.negotiator,
            factory: self.factory,
            handler: self.handler,
            gateway: self
                .gateway
                .unwrap_or_else(|| Arc::new(ConnectionGateway::new())),
            options: self.options.unwrap_or_default(),
            observers: RwLock::new(self.observers),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }
}
