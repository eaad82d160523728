//! HTTP request and response models exchanged with the host HTTP server.
//!
//! The host server translates its own request type into an [`UpgradeRequest`] and
//! writes the returned [`UpgradeResponse`] back to the client.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};

/// An HTTP request that may be a websocket upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    method: Method,
    version: Version,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    remote_address: Option<SocketAddr>,
}

impl UpgradeRequest {
    #[must_use]
    pub fn new(method: Method, version: Version, headers: HeaderMap) -> Self {
        Self {
            method,
            version,
            path: "/".to_string(),
            headers,
            body: Bytes::new(),
            remote_address: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub const fn with_remote_address(mut self, remote_address: Option<SocketAddr>) -> Self {
        self.remote_address = remote_address;
        self
    }

    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub const fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub const fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    /// First value of the header, if present and valid visible ASCII.
    #[must_use]
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Every comma-separated, trimmed token across all occurrences of the header.
    pub fn header_tokens<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .get_all(name)
            .into_iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Whether the header contains `token`, compared case-insensitively.
    #[must_use]
    pub fn has_header_token(&self, name: &str, token: &str) -> bool {
        self.header_tokens(name)
            .any(|value| value.eq_ignore_ascii_case(token))
    }
}

/// The response to an upgrade request.
///
/// A `101 Switching Protocols` response accepts the upgrade. Any other status is final.
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl UpgradeResponse {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    pub const fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    #[must_use]
    pub fn is_switching_protocols(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS
    }

    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub const fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[must_use]
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Replaces every value of the header.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: impl header::AsHeaderName) {
        self.headers.remove(name);
    }

    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Builds the final response for a rejected upgrade.
pub trait UpgradeErrorHandler: Send + Sync {
    /// Creates a response with the given status and optional reason.
    fn handle_error(
        &self,
        status: StatusCode,
        reason: Option<&str>,
        request: &UpgradeRequest,
    ) -> UpgradeResponse;
}

/// Plain text rejection responses with a `"{status} {reason}"` body.
///
/// The connection header is set to `close` since the client asked for an upgrade that
/// will not happen.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextErrorHandler;

impl UpgradeErrorHandler for PlainTextErrorHandler {
    fn handle_error(
        &self,
        status: StatusCode,
        reason: Option<&str>,
        _request: &UpgradeRequest,
    ) -> UpgradeResponse {
        let reason = reason
            .or_else(|| status.canonical_reason())
            .unwrap_or_default();

        UpgradeResponse::new(status)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_header(header::CONNECTION, HeaderValue::from_static("close"))
            .with_body(format!("{} {reason}", status.as_u16()))
    }
}
