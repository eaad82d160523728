//! Websocket handshake validation.
//!
//! [`Rfc6455Acceptor`] checks that a request is a legal RFC 6455 upgrade request and
//! produces either the `101 Switching Protocols` response or a rejection.
//! [`AllowOriginAcceptor`] layers an origin allowlist in front of another acceptor.
//!
//! Acceptors are pure: they never look at connection state and never fail with an error,
//! a rejection is just a response with a status other than 101.

use std::{collections::BTreeSet, sync::Arc};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use http::{HeaderValue, Method, StatusCode, Version, header};
use sha1::{Digest as _, Sha1};

use crate::upgrade::{PlainTextErrorHandler, UpgradeErrorHandler, UpgradeRequest, UpgradeResponse};

/// GUID appended to the client key before hashing, from RFC 6455 section 1.3.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only websocket protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

pub(crate) const CONNECTION_UPGRADE_REQUIRED: &str =
    "Bad Request: \"Connection: Upgrade\" header required";
pub(crate) const KEY_REQUIRED: &str = "Bad Request: \"Sec-Websocket-Key\" header required";
pub(crate) const KEY_INVALID: &str = "Bad Request: Invalid \"Sec-Websocket-Key\" header";
pub(crate) const VERSION_UNAVAILABLE: &str = "Bad Request: Requested Websocket version unavailable";

/// Builds a rejection with `error_handler`, then sets the optional extra header.
pub(crate) fn rejection(
    error_handler: &dyn UpgradeErrorHandler,
    request: &UpgradeRequest,
    status: StatusCode,
    reason: Option<&str>,
    header: Option<(header::HeaderName, &'static str)>,
) -> UpgradeResponse {
    log::debug!(
        "Rejecting websocket handshake from {:?}: {status} {}",
        request.remote_address(),
        reason.unwrap_or_default()
    );

    let mut response = error_handler.handle_error(status, reason, request);
    if let Some((name, value)) = header {
        response.set_header(name, HeaderValue::from_static(value));
    }
    response
}

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
///
/// ```rust
/// # use switchy_websocket_server::generate_accept_key;
/// assert_eq!(
///     generate_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
#[must_use]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Decides whether an HTTP request may be upgraded to a websocket connection.
pub trait HandshakeAcceptor: Send + Sync {
    /// Returns a `101 Switching Protocols` response to accept the request, or any other
    /// status to reject it.
    fn accept(&self, request: &UpgradeRequest) -> UpgradeResponse;
}

/// Accepts every well-formed RFC 6455 upgrade request.
///
/// Checks run in order and stop at the first failure:
///
/// 1. method is `GET` (`405`, `Allow: GET`)
/// 2. protocol is `HTTP/1.1` (`505`, `Upgrade: websocket`)
/// 3. body is empty (`400`)
/// 4. `Upgrade` contains `websocket` (`426`, `Upgrade: websocket`)
/// 5. `Connection` contains `upgrade` (`426`, `Upgrade: websocket`)
/// 6. `Sec-WebSocket-Key` is present and non-empty (`400`)
/// 7. `Sec-WebSocket-Version` contains `13` (`400`, `Sec-WebSocket-Version: 13`)
#[derive(Clone)]
pub struct Rfc6455Acceptor {
    error_handler: Arc<dyn UpgradeErrorHandler>,
}

impl std::fmt::Debug for Rfc6455Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rfc6455Acceptor").finish_non_exhaustive()
    }
}

impl Default for Rfc6455Acceptor {
    fn default() -> Self {
        Self::new(Arc::new(PlainTextErrorHandler))
    }
}

impl Rfc6455Acceptor {
    #[must_use]
    pub fn new(error_handler: Arc<dyn UpgradeErrorHandler>) -> Self {
        Self { error_handler }
    }

    fn reject(
        &self,
        request: &UpgradeRequest,
        status: StatusCode,
        reason: Option<&str>,
        header: Option<(header::HeaderName, &'static str)>,
    ) -> UpgradeResponse {
        rejection(self.error_handler.as_ref(), request, status, reason, header)
    }
}

impl HandshakeAcceptor for Rfc6455Acceptor {
    fn accept(&self, request: &UpgradeRequest) -> UpgradeResponse {
        if request.method() != Method::GET {
            return self.reject(
                request,
                StatusCode::METHOD_NOT_ALLOWED,
                None,
                Some((header::ALLOW, "GET")),
            );
        }

        if request.version() != Version::HTTP_11 {
            return self.reject(
                request,
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                None,
                Some((header::UPGRADE, "websocket")),
            );
        }

        if !request.body().is_empty() {
            return self.reject(request, StatusCode::BAD_REQUEST, None, None);
        }

        if !request.has_header_token("upgrade", "websocket") {
            return self.reject(
                request,
                StatusCode::UPGRADE_REQUIRED,
                None,
                Some((header::UPGRADE, "websocket")),
            );
        }

        if !request.has_header_token("connection", "upgrade") {
            return self.reject(
                request,
                StatusCode::UPGRADE_REQUIRED,
                Some(CONNECTION_UPGRADE_REQUIRED),
                Some((header::UPGRADE, "websocket")),
            );
        }

        let Some(key) = request
            .header(header::SEC_WEBSOCKET_KEY)
            .filter(|key| !key.is_empty())
        else {
            return self.reject(
                request,
                StatusCode::BAD_REQUEST,
                Some(KEY_REQUIRED),
                None,
            );
        };

        if !request
            .header_tokens("sec-websocket-version")
            .any(|version| version == WEBSOCKET_VERSION)
        {
            return self.reject(
                request,
                StatusCode::BAD_REQUEST,
                Some(VERSION_UNAVAILABLE),
                Some((header::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION)),
            );
        }

        let Ok(accept) = HeaderValue::from_str(&generate_accept_key(key)) else {
            return self.reject(
                request,
                StatusCode::BAD_REQUEST,
                Some(KEY_INVALID),
                None,
            );
        };

        UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::CONNECTION, HeaderValue::from_static("upgrade"))
            .with_header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(header::SEC_WEBSOCKET_ACCEPT, accept)
    }
}

/// Rejects requests whose `Origin` header is not in an allowlist, delegating the rest.
///
/// Browsers do not apply the same-origin policy to websocket connections, so most web
/// applications should restrict origins.
#[derive(Clone)]
pub struct AllowOriginAcceptor {
    allowed_origins: BTreeSet<String>,
    inner: Arc<dyn HandshakeAcceptor>,
    error_handler: Arc<dyn UpgradeErrorHandler>,
}

impl std::fmt::Debug for AllowOriginAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllowOriginAcceptor")
            .field("allowed_origins", &self.allowed_origins)
            .finish_non_exhaustive()
    }
}

impl AllowOriginAcceptor {
    /// Creates an acceptor that checks origins before running [`Rfc6455Acceptor`].
    #[must_use]
    pub fn new<I, S>(allowed_origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_inner(allowed_origins, Arc::new(Rfc6455Acceptor::default()))
    }

    /// Creates an acceptor that checks origins before running `inner`.
    #[must_use]
    pub fn with_inner<I, S>(allowed_origins: I, inner: Arc<dyn HandshakeAcceptor>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_origins: allowed_origins.into_iter().map(Into::into).collect(),
            inner,
            error_handler: Arc::new(PlainTextErrorHandler),
        }
    }

    #[must_use]
    pub fn with_error_handler(mut self, error_handler: Arc<dyn UpgradeErrorHandler>) -> Self {
        self.error_handler = error_handler;
        self
    }

    #[must_use]
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        origin.is_some_and(|origin| self.allowed_origins.contains(origin))
    }
}

impl HandshakeAcceptor for AllowOriginAcceptor {
    fn accept(&self, request: &UpgradeRequest) -> UpgradeResponse {
        let origin = request.header(header::ORIGIN);

        if !self.is_allowed(origin) {
            log::debug!("Rejecting websocket handshake from origin {origin:?}");
            return self.error_handler.handle_error(
                StatusCode::FORBIDDEN,
                Some("Origin forbidden"),
                request,
            );
        }

        self.inner.accept(request)
    }
}

impl<F> HandshakeAcceptor for F
where
    F: Fn(&UpgradeRequest) -> UpgradeResponse + Send + Sync,
{
    fn accept(&self, request: &UpgradeRequest) -> UpgradeResponse {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn valid_request() -> UpgradeRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("x3JJHMbDL1EzLkh9GBhXDw=="),
        );
        headers.insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static("13"),
        );
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        UpgradeRequest::new(Method::GET, Version::HTTP_11, headers)
    }

    fn accept(request: &UpgradeRequest) -> UpgradeResponse {
        Rfc6455Acceptor::default().accept(request)
    }

    #[test_log::test]
    fn accepts_valid_handshake() {
        let response = accept(&valid_request());

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.header("upgrade"), Some("websocket"));
        assert_eq!(response.header("connection"), Some("upgrade"));
        assert_eq!(
            response.header("sec-websocket-accept"),
            Some("HSmrc0sMlYUkAGmm5OPpG2HaGWk=")
        );
        assert!(response.body().is_empty());
    }

    #[test_log::test]
    fn accept_key_matches_known_value() {
        assert_eq!(
            generate_accept_key("x3JJHMbDL1EzLkh9GBhXDw=="),
            "HSmrc0sMlYUkAGmm5OPpG2HaGWk="
        );
    }

    #[test_log::test]
    fn accepts_tokens_among_other_values() {
        let mut request = valid_request();
        let headers = request.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c, WebSocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.append(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static("8, 13"),
        );

        assert_eq!(accept(&request).status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[test_log::test]
    fn rejects_non_get_method() {
        let request = UpgradeRequest::new(
            Method::POST,
            Version::HTTP_11,
            valid_request().headers().clone(),
        );

        let response = accept(&request);

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.header("allow"), Some("GET"));
        assert_eq!(response.header("sec-websocket-accept"), None);
    }

    #[test_log::test]
    fn rejects_http_1_0() {
        let request = UpgradeRequest::new(
            Method::GET,
            Version::HTTP_10,
            valid_request().headers().clone(),
        );

        let response = accept(&request);

        assert_eq!(response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
        assert_eq!(response.header("upgrade"), Some("websocket"));
    }

    #[test_log::test]
    fn rejects_non_empty_body() {
        let request = valid_request().with_body("Non-empty body");

        let response = accept(&request);

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.header("sec-websocket-accept"), None);
    }

    #[test_log::test]
    fn rejects_missing_upgrade_token() {
        let mut request = valid_request();
        request
            .headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("no websocket!"));

        let response = accept(&request);

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(response.header("upgrade"), Some("websocket"));
    }

    #[test_log::test]
    fn rejects_missing_connection_token() {
        let mut request = valid_request();
        request
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("no upgrade!"));

        let response = accept(&request);

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(response.header("upgrade"), Some("websocket"));
        assert_eq!(
            response.body().as_ref(),
            b"426 Bad Request: \"Connection: Upgrade\" header required"
        );
    }

    #[test_log::test]
    fn rejects_missing_key() {
        let mut request = valid_request();
        request.headers_mut().remove(header::SEC_WEBSOCKET_KEY);

        assert_eq!(accept(&request).status(), StatusCode::BAD_REQUEST);
    }

    #[test_log::test]
    fn rejects_empty_key() {
        let mut request = valid_request();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static(""));

        assert_eq!(accept(&request).status(), StatusCode::BAD_REQUEST);
    }

    #[test_log::test]
    fn rejects_unsupported_version() {
        let mut request = valid_request();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("12"));

        let response = accept(&request);

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.header("sec-websocket-version"), Some("13"));
    }

    #[test_log::test]
    fn checks_run_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("nope"));
        let request = UpgradeRequest::new(Method::PUT, Version::HTTP_10, headers).with_body("x");

        assert_eq!(accept(&request).status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test_log::test]
    fn origin_acceptor_rejects_unknown_origin() {
        let acceptor = AllowOriginAcceptor::new(["http://localhost:1337"]);
        let mut request = valid_request();
        request.headers_mut().insert(
            header::ORIGIN,
            HeaderValue::from_static("http://evil.example"),
        );

        let response = acceptor.accept(&request);

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_ref(), b"403 Origin forbidden");
    }

    #[test_log::test]
    fn origin_acceptor_rejects_missing_origin() {
        let acceptor = AllowOriginAcceptor::new(["http://localhost:1337"]);

        assert_eq!(
            acceptor.accept(&valid_request()).status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test_log::test]
    fn origin_acceptor_delegates_allowed_origin() {
        let acceptor = AllowOriginAcceptor::new(["http://localhost:1337"]);
        let mut request = valid_request();
        request.headers_mut().insert(
            header::ORIGIN,
            HeaderValue::from_static("http://localhost:1337"),
        );

        let response = acceptor.accept(&request);

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.header("sec-websocket-accept"),
            Some("HSmrc0sMlYUkAGmm5OPpG2HaGWk=")
        );
    }

    #[test_log::test]
    fn origin_acceptor_still_validates_handshake() {
        let acceptor = AllowOriginAcceptor::new(["http://localhost:1337"]);
        let mut request = valid_request();
        request.headers_mut().insert(
            header::ORIGIN,
            HeaderValue::from_static("http://localhost:1337"),
        );
        request.headers_mut().remove(header::SEC_WEBSOCKET_KEY);

        assert_eq!(acceptor.accept(&request).status(), StatusCode::BAD_REQUEST);
    }
}
