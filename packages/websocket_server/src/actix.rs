//! `actix-web` binding.
//!
//! Routes an actix request through an [`Endpoint`] and uses `actix-ws` as the frame codec
//! for upgraded connections.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use actix_web::{HttpRequest, HttpResponse, web};
//! # use switchy_websocket_server::{Endpoint, actix::{ActixTransport, handle_request}};
//! async fn websocket(
//!     req: HttpRequest,
//!     payload: web::Payload,
//!     endpoint: web::Data<Arc<Endpoint<ActixTransport>>>,
//! ) -> Result<HttpResponse, actix_web::Error> {
//!     handle_request(endpoint.get_ref(), &req, payload).await
//! }
//! ```

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use actix_http::ws::HandshakeError;
use actix_web::{HttpRequest, HttpResponse, web};
use actix_ws::{
    AggregatedMessage, AggregatedMessageStream, CloseReason, MessageStream, ProtocolError, Session,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ConnId,
    close::{CloseCode, CloseInfo},
    connection::{
        CloseCallback, CloseNotifier, Connection, ConnectionError, Message, next_connection_id,
    },
    endpoint::{ConnectionHandler, Endpoint, EndpointBuilder, EndpointResponse},
    extensions::CompressionContext,
    factory::{ConnectionFactory, Transport},
    handshake::{
        CONNECTION_UPGRADE_REQUIRED, KEY_INVALID, VERSION_UNAVAILABLE, WEBSOCKET_VERSION,
    },
    options::ServerOptions,
    upgrade::{UpgradeRequest, UpgradeResponse},
};

/// The session and message stream produced by `actix_ws::handle`.
pub struct ActixTransport {
    pub session: Session,
    pub stream: MessageStream,
    pub remote_address: Option<SocketAddr>,
}

impl Transport for ActixTransport {
    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }
}

struct Shared {
    id: ConnId,
    remote_address: Option<SocketAddr>,
    session: Mutex<Option<Session>>,
    notifier: CloseNotifier,
    missed_pings: AtomicUsize,
    token: CancellationToken,
}

impl Shared {
    fn session(&self) -> Result<Session, ConnectionError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConnectionError::Closed)
    }

    fn take_session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Marks the connection closed and sends a close frame if nothing has been sent yet.
    async fn close(
        &self,
        code: CloseCode,
        reason: &str,
        by_peer: bool,
    ) -> Result<(), ConnectionError> {
        let Some(session) = self.take_session() else {
            return Ok(());
        };

        self.notifier
            .notify(self.id, CloseInfo::new(code, reason, by_peer));
        self.token.cancel();

        let reason = match code {
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsError => None,
            code => Some(CloseReason {
                code: u16::from(code).into(),
                description: (!reason.is_empty()).then(|| reason.to_string()),
            }),
        };

        session
            .close(reason)
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

/// A websocket connection backed by an `actix-ws` session.
///
/// Incoming frames are read by a task on the actix worker that owns the connection and
/// forwarded to [`Connection::receive`]. That task also answers pings and sends the
/// heartbeat.
pub struct ActixConnection {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl std::fmt::Debug for ActixConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActixConnection")
            .field("id", &self.shared.id)
            .field("remote_address", &self.shared.remote_address)
            .field("closed", &self.shared.notifier.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for ActixConnection {
    fn id(&self) -> ConnId {
        self.shared.id
    }

    fn is_closed(&self) -> bool {
        self.shared.notifier.is_closed()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.shared.remote_address
    }

    fn close_info(&self) -> Option<CloseInfo> {
        self.shared.notifier.info()
    }

    async fn receive(&self) -> Option<Message> {
        self.incoming.lock().await.recv().await
    }

    async fn send_text(&self, data: &str) -> Result<(), ConnectionError> {
        let mut session = self.shared.session()?;
        session
            .text(data.to_string())
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut session = self.shared.session()?;
        session
            .binary(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), ConnectionError> {
        self.shared.close(code, reason, false).await
    }

    fn on_close(&self, callback: CloseCallback) {
        self.shared.notifier.register(self.shared.id, callback);
    }
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    period: Duration,
    queued_ping_limit: usize,
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Message reported by `actix-ws` when aggregated continuations exceed their limit.
const CONTINUATION_OVERFLOW: &str = "Exceeded maximum continuation size";

fn protocol_close_code(error: &ProtocolError) -> CloseCode {
    match error {
        ProtocolError::Overflow => CloseCode::MessageTooLarge,
        ProtocolError::Io(e) if e.to_string() == CONTINUATION_OVERFLOW => {
            CloseCode::MessageTooLarge
        }
        ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            CloseCode::InconsistentFrameDataType
        }
        _ => CloseCode::ProtocolError,
    }
}

#[allow(clippy::future_not_send)]
async fn pump(
    shared: Arc<Shared>,
    mut stream: AggregatedMessageStream,
    tx: mpsc::UnboundedSender<Message>,
    heartbeat: Option<Heartbeat>,
) {
    let id = shared.id;
    let mut interval = heartbeat.map(|heartbeat| {
        tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat.period,
            heartbeat.period,
        )
    });

    loop {
        tokio::select! {
            () = shared.token.cancelled() => break,
            () = tick(&mut interval) => {
                let limit = heartbeat.map_or(usize::MAX, |heartbeat| heartbeat.queued_ping_limit);
                if shared.missed_pings.load(Ordering::SeqCst) >= limit {
                    log::debug!("pump: connection #{id} exceeded unanswered PING limit");
                    let _ = shared
                        .close(CloseCode::PolicyViolation, "Exceeded unanswered PING limit", false)
                        .await;
                    break;
                }
                shared.missed_pings.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut session) = shared.session() {
                    let _ = session.ping(b"").await;
                }
            }
            item = stream.next() => match item {
                Some(Ok(AggregatedMessage::Text(text))) => {
                    let _ = tx.send(Message::Text(text.to_string()));
                }
                Some(Ok(AggregatedMessage::Binary(bytes))) => {
                    let _ = tx.send(Message::Binary(bytes));
                }
                Some(Ok(AggregatedMessage::Ping(bytes))) => {
                    if let Ok(mut session) = shared.session() {
                        let _ = session.pong(&bytes).await;
                    }
                }
                Some(Ok(AggregatedMessage::Pong(_))) => {
                    shared.missed_pings.store(0, Ordering::SeqCst);
                }
                Some(Ok(AggregatedMessage::Close(reason))) => {
                    let (code, description) = reason.map_or((CloseCode::NoStatus, None), |reason| {
                        (CloseCode::from(u16::from(reason.code)), reason.description)
                    });
                    log::trace!("pump: connection #{id} closed by peer with {code}");
                    let _ = shared
                        .close(code, description.as_deref().unwrap_or_default(), true)
                        .await;
                    break;
                }
                Some(Err(e)) => {
                    log::debug!("pump: connection #{id} protocol error: {e}");
                    let _ = shared.close(protocol_close_code(&e), &e.to_string(), false).await;
                    break;
                }
                None => {
                    log::trace!("pump: connection #{id} stream ended");
                    let _ = shared.close(CloseCode::Abnormal, "", true).await;
                    break;
                }
            },
        }
    }

    log::trace!("pump: stopped reading connection #{id}");
}

/// [`ConnectionFactory`] for [`ActixTransport`]s.
///
/// Applies the frame and message size limits and the heartbeat from [`ServerOptions`].
/// Must be called from an actix worker since the frame reader is a local task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActixConnectionFactory;

impl ConnectionFactory<ActixTransport> for ActixConnectionFactory {
    fn create(
        &self,
        _request: &UpgradeRequest,
        _response: &UpgradeResponse,
        transport: ActixTransport,
        compression: Option<Arc<dyn CompressionContext>>,
        options: &ServerOptions,
    ) -> Arc<dyn Connection> {
        let ActixTransport {
            session,
            stream,
            remote_address,
        } = transport;

        if let Some(compression) = compression {
            log::warn!(
                "ActixConnectionFactory: {} negotiated but not supported by actix-ws",
                compression.name()
            );
        }

        let shared = Arc::new(Shared {
            id: next_connection_id(),
            remote_address,
            session: Mutex::new(Some(session)),
            notifier: CloseNotifier::new(),
            missed_pings: AtomicUsize::new(0),
            token: CancellationToken::new(),
        });

        let stream = stream
            .max_frame_size(options.frame_size_limit())
            .aggregate_continuations()
            .max_continuation_size(options.message_size_limit());

        let heartbeat = options.heartbeat_enabled().then(|| Heartbeat {
            period: options.heartbeat_period(),
            queued_ping_limit: options.queued_ping_limit(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        actix_web::rt::spawn(pump(shared.clone(), stream, tx, heartbeat));

        Arc::new(ActixConnection {
            shared,
            incoming: tokio::sync::Mutex::new(rx),
        })
    }
}

/// Builder for an [`Endpoint`] served by actix-web.
///
/// Extension negotiation is disabled since the `actix-ws` codec does not implement
/// `permessage-deflate`.
///
/// `actix-ws` validates the handshake again once the endpoint has accepted it, and is
/// stricter than [`Rfc6455Acceptor`](crate::Rfc6455Acceptor): `Sec-WebSocket-Version` must
/// be exactly `13` rather than a list containing it, `Sec-WebSocket-Key` must decode to 16
/// bytes, and `Connection: close` anywhere overrides `upgrade`. Chunked upgrade requests
/// are refused too, since the upgraded stream ends with the last chunk. [`handle_request`]
/// answers these with [`PendingUpgrade::reject`](crate::PendingUpgrade::reject), so the
/// response comes from the endpoint's [`UpgradeErrorHandler`](crate::UpgradeErrorHandler).
#[must_use]
pub fn endpoint_builder(handler: Arc<dyn ConnectionHandler>) -> EndpointBuilder<ActixTransport> {
    Endpoint::builder(handler, Arc::new(ActixConnectionFactory)).with_negotiator(None)
}

fn is_chunked(req: &HttpRequest) -> bool {
    req.headers()
        .contains_key(actix_web::http::header::TRANSFER_ENCODING)
}

fn has_body(req: &HttpRequest) -> bool {
    let headers = req.headers();

    is_chunked(req)
        || headers
            .get(actix_web::http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .is_some_and(|length| length > 0)
}

fn convert_version(version: actix_web::http::Version) -> http::Version {
    use actix_web::http::Version;

    if version == Version::HTTP_09 {
        http::Version::HTTP_09
    } else if version == Version::HTTP_10 {
        http::Version::HTTP_10
    } else if version == Version::HTTP_2 {
        http::Version::HTTP_2
    } else if version == Version::HTTP_3 {
        http::Version::HTTP_3
    } else if version == Version::HTTP_11 {
        http::Version::HTTP_11
    } else {
        // Anything unknown must fail the HTTP/1.1 check.
        http::Version::HTTP_10
    }
}

fn to_upgrade_request(req: &HttpRequest, body: Bytes) -> Result<UpgradeRequest, actix_web::Error> {
    let method = http::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(actix_web::error::ErrorBadRequest)?;

    let mut headers = http::HeaderMap::new();
    for (name, value) in req.headers() {
        let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_str().as_bytes()),
            http::HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }

    Ok(UpgradeRequest::new(method, convert_version(req.version()), headers)
        .with_path(req.path())
        .with_body(body)
        .with_remote_address(req.peer_addr()))
}

fn copy_headers(from: &http::HeaderMap, to: &mut actix_web::http::header::HeaderMap) {
    use actix_web::http::header::{HeaderName, HeaderValue};

    for name in from.keys() {
        let Ok(actix_name) = HeaderName::from_bytes(name.as_str().as_bytes()) else {
            continue;
        };

        to.remove(&actix_name);
        for value in from.get_all(name) {
            if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                to.append(actix_name.clone(), value);
            }
        }
    }
}

fn to_http_response(response: &UpgradeResponse) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);

    let mut http_response = HttpResponse::build(status).body(response.body().clone());
    copy_headers(response.headers(), http_response.headers_mut());
    http_response
}

type Rejection = (
    http::StatusCode,
    Option<&'static str>,
    Option<(http::HeaderName, &'static str)>,
);

/// Status, reason and header for an `actix-ws` refusal of an accepted handshake.
fn codec_rejection(error: &actix_web::Error) -> Rejection {
    use http::{StatusCode, header};

    match error.as_error::<HandshakeError>() {
        Some(HandshakeError::GetMethodRequired) => (
            StatusCode::METHOD_NOT_ALLOWED,
            None,
            Some((header::ALLOW, "GET")),
        ),
        Some(HandshakeError::NoWebsocketUpgrade) => (
            StatusCode::UPGRADE_REQUIRED,
            None,
            Some((header::UPGRADE, "websocket")),
        ),
        Some(HandshakeError::NoConnectionUpgrade) => (
            StatusCode::UPGRADE_REQUIRED,
            Some(CONNECTION_UPGRADE_REQUIRED),
            Some((header::UPGRADE, "websocket")),
        ),
        Some(HandshakeError::NoVersionHeader | HandshakeError::UnsupportedVersion) => (
            StatusCode::BAD_REQUEST,
            Some(VERSION_UNAVAILABLE),
            Some((header::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION)),
        ),
        Some(HandshakeError::BadWebsocketKey) => {
            (StatusCode::BAD_REQUEST, Some(KEY_INVALID), None)
        }
        None => (StatusCode::INTERNAL_SERVER_ERROR, None, None),
    }
}

/// Runs `req` through `endpoint`, upgrading it to a websocket connection when accepted.
///
/// See [`endpoint_builder`] for the accepted requests `actix-ws` still refuses.
///
/// # Errors
///
/// * If the request body could not be read
/// * If the request method is not a valid HTTP method
#[allow(clippy::future_not_send)]
pub async fn handle_request(
    endpoint: &Arc<Endpoint<ActixTransport>>,
    req: &HttpRequest,
    mut payload: web::Payload,
) -> Result<HttpResponse, actix_web::Error> {
    // Only emptiness matters, so the first chunk is enough.
    let mut body = Bytes::new();
    if has_body(req) {
        if let Some(chunk) = payload.next().await {
            body = chunk?;
        }
    }

    let request = to_upgrade_request(req, body)?;

    let pending = match endpoint.handle_request(request) {
        EndpointResponse::Reject(response) => return Ok(to_http_response(&response)),
        EndpointResponse::Upgrade(pending) => pending,
    };

    if is_chunked(req) {
        log::debug!("handle_request: refusing chunked upgrade request");
        let response = pending.reject(http::StatusCode::BAD_REQUEST, None, None);
        return Ok(to_http_response(&response));
    }

    match actix_ws::handle(req, payload) {
        Ok((mut response, session, stream)) => {
            copy_headers(pending.response().headers(), response.headers_mut());

            pending.upgrade(ActixTransport {
                session,
                stream,
                remote_address: req.peer_addr(),
            });

            Ok(response)
        }
        Err(e) => {
            log::debug!("handle_request: actix-ws refused accepted upgrade: {e}");
            let (status, reason, header) = codec_rejection(&e);
            Ok(to_http_response(&pending.reject(status, reason, header)))
        }
    }
}
