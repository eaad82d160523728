//! Server-side websocket connection management.
//!
//! This crate upgrades qualifying HTTP requests to websocket connections, tracks the
//! resulting set of live connections, and fans messages out to them with ordered,
//! partial-failure-tolerant delivery.
//!
//! The frame codec and the HTTP server are external collaborators. A codec is
//! represented by the [`Connection`] trait and the HTTP layer talks to an
//! [`Endpoint`] through the [`UpgradeRequest`]/[`UpgradeResponse`] models.
//!
//! # Features
//!
//! * `actix` - Binds an [`Endpoint`] to `actix-web`, using `actix-ws` as the frame codec
//!
//! # Main Components
//!
//! * [`HandshakeAcceptor`] - Validates upgrade requests ([`Rfc6455Acceptor`], [`AllowOriginAcceptor`])
//! * [`ExtensionNegotiator`] - Negotiates extensions such as [`DeflateNegotiator`]
//! * [`ConnectionFactory`] - Builds a [`Connection`] from an upgraded transport
//! * [`SendQueue`] - Per-connection ordered, non-blocking writes
//! * [`Gateway`] - Broadcast, multicast and unicast over registered connections
//! * [`Endpoint`] - Wires everything together for each incoming request
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use switchy_websocket_server::{
//! #     Connection, ConnectionGateway, ConnectionHandler, Gateway as _, HandlerError,
//! #     Message, UpgradeRequest, UpgradeResponse,
//! # };
//! struct Echo {
//!     gateway: ConnectionGateway,
//! }
//!
//! #[async_trait::async_trait]
//! impl ConnectionHandler for Echo {
//!     async fn handle_connection(
//!         &self,
//!         connection: Arc<dyn Connection>,
//!         _request: &UpgradeRequest,
//!         _response: &UpgradeResponse,
//!     ) -> Result<(), HandlerError> {
//!         while let Some(Message::Text(text)) = connection.receive().await {
//!             let _ = self.gateway.send(&text, connection.id());
//!         }
//!         Ok(())
//!     }
//! }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(feature = "actix")]
pub mod actix;

pub mod close;
pub mod connection;
pub mod endpoint;
pub mod extensions;
pub mod factory;
pub mod gateway;
pub mod handshake;
pub mod options;
pub mod send_queue;
pub mod upgrade;

#[cfg(test)]
mod test_utils;

pub use close::{CloseCode, CloseInfo};
pub use connection::{
    CloseCallback, CloseNotifier, Connection, ConnectionError, Message, next_connection_id,
};
pub use endpoint::{
    ConnectionHandler, Endpoint, EndpointBuilder, EndpointResponse, HandlerError, LifecycleError,
    ObserverError, PendingUpgrade, ServerObserver,
};
pub use extensions::{
    CompressionContext, DeflateContext, DeflateNegotiator, ExtensionNegotiator,
    negotiate_extensions,
};
pub use factory::{ConnectionFactory, Transport, tune_transport};
pub use gateway::{ConnectionGateway, Gateway, SendOutcome, SettleFuture};
pub use handshake::{
    AllowOriginAcceptor, HandshakeAcceptor, Rfc6455Acceptor, generate_accept_key,
};
pub use options::{OptionsError, ServerOptions};
pub use send_queue::{Payload, SendHandle, SendQueue, SendQueueState};
pub use upgrade::{PlainTextErrorHandler, UpgradeErrorHandler, UpgradeRequest, UpgradeResponse};

/// Process-unique identifier of a websocket connection.
pub type ConnId = u64;
