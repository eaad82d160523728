#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Broadcast Server Example
//!
//! Every text message a client sends is relayed to all connected clients, prefixed with
//! the id of the sender. Connect with any websocket client from an allowed origin:
//!
//! ```text
//! websocat --origin http://localhost:1337 ws://127.0.0.1:1337/broadcast
//! ```
//!
//! Server options are read from the `WS_*` environment variables.

use std::sync::Arc;

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
use switchy_websocket_server::{
    AllowOriginAcceptor, Connection, ConnectionGateway, ConnectionHandler, Endpoint, Gateway as _,
    HandlerError, Message, ServerOptions, UpgradeRequest, UpgradeResponse,
    actix::{self, ActixTransport},
};

const BIND_ADDRESS: (&str, u16) = ("127.0.0.1", 1337);

struct BroadcastHandler {
    gateway: ConnectionGateway,
}

#[async_trait::async_trait]
impl ConnectionHandler for BroadcastHandler {
    async fn handle_connection(
        &self,
        connection: Arc<dyn Connection>,
        _request: &UpgradeRequest,
        _response: &UpgradeResponse,
    ) -> Result<(), HandlerError> {
        let id = connection.id();
        log::info!("Client #{id} joined ({} connected)", self.gateway.len());

        while let Some(message) = connection.receive().await {
            match message {
                Message::Text(text) => {
                    // Delivery is ordered by the gateway; nothing to wait for here.
                    drop(self.gateway.broadcast(&format!("{id}: {text}"), &[]));
                }
                Message::Binary(data) => {
                    log::debug!("Ignoring {} byte binary message from #{id}", data.len());
                }
            }
        }

        log::info!("Client #{id} left");

        Ok(())
    }
}

async fn broadcast(
    req: HttpRequest,
    payload: web::Payload,
    endpoint: web::Data<Arc<Endpoint<ActixTransport>>>,
) -> Result<HttpResponse, actix_web::Error> {
    actix::handle_request(endpoint.get_ref(), &req, payload).await
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(
        if cfg!(debug_assertions) {
            "switchy=trace"
        } else {
            "switchy=info"
        },
    ));

    let options = ServerOptions::from_env().map_err(std::io::Error::other)?;
    let gateway = ConnectionGateway::new();

    let endpoint = actix::endpoint_builder(Arc::new(BroadcastHandler {
        gateway: gateway.clone(),
    }))
    .with_gateway(Arc::new(gateway))
    .with_acceptor(Arc::new(AllowOriginAcceptor::new([
        "http://localhost:1337",
        "http://127.0.0.1:1337",
        "http://[::1]:1337",
    ])))
    .with_options(options)
    .build();

    endpoint.start().await.map_err(std::io::Error::other)?;

    log::info!(
        "Listening on ws://{}:{}/broadcast",
        BIND_ADDRESS.0,
        BIND_ADDRESS.1
    );

    let data = web::Data::new(endpoint.clone());
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/broadcast", web::get().to(broadcast))
    })
    .bind(BIND_ADDRESS)?
    .run()
    .await?;

    endpoint.stop().await.map_err(std::io::Error::other)?;

    Ok(())
}
