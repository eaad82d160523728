//! Websocket extension negotiation.
//!
//! Only the handshake half of an extension lives here: choosing an offer and writing the
//! agreed parameters to the response. Applying the extension to frames is the codec's job.

use std::{fmt, sync::Arc};

use http::{HeaderValue, header};

use crate::upgrade::{UpgradeRequest, UpgradeResponse};

/// Name of the RFC 7692 compression extension.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;

/// Compression agreed with a client during the handshake.
///
/// Immutable for the lifetime of the connection.
pub trait CompressionContext: Send + Sync + fmt::Debug {
    /// Extension name, e.g. `permessage-deflate`.
    fn name(&self) -> &str;

    /// Value to add to the `Sec-WebSocket-Extensions` response header.
    fn extension_header(&self) -> String;

    /// Payloads smaller than this many bytes are sent uncompressed.
    fn compression_threshold(&self) -> usize;
}

/// Builds a [`CompressionContext`] from a single extension offer.
pub trait ExtensionNegotiator: Send + Sync {
    /// Returns a context if the offer names a supported extension with acceptable
    /// parameters, otherwise `None`.
    fn negotiate(&self, offer: &str) -> Option<Arc<dyn CompressionContext>>;
}

/// Negotiates the first acceptable offer in the request's `Sec-WebSocket-Extensions`
/// header and records the agreed extension on the response.
///
/// Any extension value already present on the response is kept, the new one is appended
/// with `", "`.
pub fn negotiate_extensions(
    negotiator: &dyn ExtensionNegotiator,
    request: &UpgradeRequest,
    response: &mut UpgradeResponse,
) -> Option<Arc<dyn CompressionContext>> {
    let context = request
        .header_tokens("sec-websocket-extensions")
        .find_map(|offer| negotiator.negotiate(offer))?;

    let extension = context.extension_header();
    let value = match response.header(header::SEC_WEBSOCKET_EXTENSIONS) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {extension}"),
        _ => extension,
    };

    let Ok(value) = HeaderValue::from_str(&value) else {
        log::warn!("negotiate_extensions: invalid extension header value {value:?}");
        return None;
    };

    log::trace!("negotiate_extensions: negotiated {value:?}");
    response.set_header(header::SEC_WEBSOCKET_EXTENSIONS, value);

    Some(context)
}

/// Negotiated `permessage-deflate` parameters.
///
/// Window sizes are only present when they appear in the response header, in which case
/// they are binding. Absent values mean the RFC 7692 default of 15 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateContext {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
    pub compression_threshold: usize,
}

impl DeflateContext {
    /// Window size the server compresses with.
    #[must_use]
    pub fn server_window_bits(&self) -> u8 {
        self.server_max_window_bits.unwrap_or(MAX_WINDOW_BITS)
    }

    /// Window size the client compresses with.
    #[must_use]
    pub fn client_window_bits(&self) -> u8 {
        self.client_max_window_bits.unwrap_or(MAX_WINDOW_BITS)
    }
}

impl CompressionContext for DeflateContext {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn extension_header(&self) -> String {
        let mut header = PERMESSAGE_DEFLATE.to_string();

        if self.server_no_context_takeover {
            header.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            header.push_str("; client_no_context_takeover");
        }
        if let Some(bits) = self.server_max_window_bits {
            header.push_str(&format!("; server_max_window_bits={bits}"));
        }
        if let Some(bits) = self.client_max_window_bits {
            header.push_str(&format!("; client_max_window_bits={bits}"));
        }

        header
    }

    fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }
}

/// [`ExtensionNegotiator`] for RFC 7692 `permessage-deflate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateNegotiator {
    server_no_context_takeover: bool,
    server_max_window_bits: u8,
    compression_threshold: usize,
}

impl Default for DeflateNegotiator {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            compression_threshold: 32,
        }
    }
}

#[derive(Default)]
struct DeflateOffer {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    client_max_window_bits: Option<Option<u8>>,
}

fn parse_window_bits(value: &str) -> Option<u8> {
    value
        .trim_matches('"')
        .parse::<u8>()
        .ok()
        .filter(|bits| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(bits))
}

impl DeflateOffer {
    fn parse(offer: &str) -> Option<Self> {
        let mut parts = offer.split(';').map(str::trim);

        if !parts
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE))
        {
            return None;
        }

        let mut parsed = Self::default();

        for param in parts.filter(|param| !param.is_empty()) {
            let (key, value) = match param.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (param, None),
            };

            match (key.to_ascii_lowercase().as_str(), value) {
                ("server_no_context_takeover", None) if !parsed.server_no_context_takeover => {
                    parsed.server_no_context_takeover = true;
                }
                ("client_no_context_takeover", None) if !parsed.client_no_context_takeover => {
                    parsed.client_no_context_takeover = true;
                }
                ("server_max_window_bits", Some(value))
                    if parsed.server_max_window_bits.is_none() =>
                {
                    parsed.server_max_window_bits = Some(parse_window_bits(value)?);
                }
                ("client_max_window_bits", value) if parsed.client_max_window_bits.is_none() => {
                    parsed.client_max_window_bits = Some(match value {
                        Some(value) => Some(parse_window_bits(value)?),
                        None => None,
                    });
                }
                _ => {
                    log::debug!("DeflateOffer: rejecting offer {offer:?} on parameter {param:?}");
                    return None;
                }
            }
        }

        Some(parsed)
    }
}

impl DeflateNegotiator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always ask clients to reset the server's compression context between messages.
    #[must_use]
    pub const fn with_server_no_context_takeover(mut self, enabled: bool) -> Self {
        self.server_no_context_takeover = enabled;
        self
    }

    /// Largest window the server is willing to compress with, clamped to 8..=15.
    ///
    /// Only used when a client offers `server_max_window_bits`.
    #[must_use]
    pub fn with_server_max_window_bits(mut self, bits: u8) -> Self {
        self.server_max_window_bits = bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        self
    }

    #[must_use]
    pub const fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }
}

impl ExtensionNegotiator for DeflateNegotiator {
    fn negotiate(&self, offer: &str) -> Option<Arc<dyn CompressionContext>> {
        let offer = DeflateOffer::parse(offer)?;

        Some(Arc::new(DeflateContext {
            server_no_context_takeover: offer.server_no_context_takeover
                || self.server_no_context_takeover,
            client_no_context_takeover: offer.client_no_context_takeover,
            server_max_window_bits: offer
                .server_max_window_bits
                .map(|bits| bits.min(self.server_max_window_bits)),
            client_max_window_bits: offer.client_max_window_bits.flatten(),
            compression_threshold: self.compression_threshold,
        }))
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, Method, StatusCode, Version};
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(extensions: &'static str) -> UpgradeRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static(extensions),
        );
        UpgradeRequest::new(Method::GET, Version::HTTP_11, headers)
    }

    fn header_for(offer: &str) -> Option<String> {
        DeflateNegotiator::new()
            .negotiate(offer)
            .map(|context| context.extension_header())
    }

    #[test_log::test]
    fn accepts_bare_offer() {
        assert_eq!(
            header_for("permessage-deflate"),
            Some("permessage-deflate".to_string())
        );
    }

    #[test_log::test]
    fn echoes_offered_parameters() {
        assert_eq!(
            header_for(
                "permessage-deflate; client_no_context_takeover; server_no_context_takeover; \
                 server_max_window_bits=10; client_max_window_bits=9"
            ),
            Some(
                "permessage-deflate; server_no_context_takeover; client_no_context_takeover; \
                 server_max_window_bits=10; client_max_window_bits=9"
                    .to_string()
            )
        );
    }

    #[test_log::test]
    fn omits_client_window_bits_without_value() {
        assert_eq!(
            header_for("permessage-deflate; client_max_window_bits"),
            Some("permessage-deflate".to_string())
        );
    }

    #[test_log::test]
    fn limits_server_window_to_configured_maximum() {
        let context = DeflateNegotiator::new()
            .with_server_max_window_bits(9)
            .negotiate("permessage-deflate; server_max_window_bits=12")
            .unwrap();

        assert_eq!(
            context.extension_header(),
            "permessage-deflate; server_max_window_bits=9"
        );
    }

    #[test_log::test]
    fn never_sends_server_window_bits_unless_offered() {
        assert_eq!(
            DeflateNegotiator::new()
                .with_server_max_window_bits(9)
                .with_server_no_context_takeover(true)
                .negotiate("permessage-deflate")
                .map(|context| context.extension_header()),
            Some("permessage-deflate; server_no_context_takeover".to_string())
        );
    }

    #[test_log::test]
    fn rejects_invalid_offers() {
        for offer in [
            "x-webkit-deflate-frame",
            "permessage-deflate; unknown_param",
            "permessage-deflate; server_no_context_takeover; server_no_context_takeover",
            "permessage-deflate; server_max_window_bits=7",
            "permessage-deflate; server_max_window_bits=16",
            "permessage-deflate; server_max_window_bits",
            "permessage-deflate; client_max_window_bits=abc",
            "permessage-deflate; client_no_context_takeover=1",
        ] {
            assert_eq!(header_for(offer), None, "{offer} should be rejected");
        }
    }

    #[test_log::test]
    fn negotiates_first_acceptable_offer() {
        let request = request(
            "permessage-deflate; bogus, permessage-deflate; client_no_context_takeover, \
             permessage-deflate",
        );
        let mut response = UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS);

        let context = negotiate_extensions(&DeflateNegotiator::new(), &request, &mut response);

        assert_eq!(context.unwrap().name(), PERMESSAGE_DEFLATE);
        assert_eq!(
            response.header("sec-websocket-extensions"),
            Some("permessage-deflate; client_no_context_takeover")
        );
    }

    #[test_log::test]
    fn merges_with_existing_extension_header() {
        let request = request("permessage-deflate");
        let mut response = UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS).with_header(
            header::SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("x-custom"),
        );

        negotiate_extensions(&DeflateNegotiator::new(), &request, &mut response);

        assert_eq!(
            response.header("sec-websocket-extensions"),
            Some("x-custom, permessage-deflate")
        );
    }

    #[test_log::test]
    fn leaves_response_untouched_without_match() {
        let request = request("x-webkit-deflate-frame");
        let mut response = UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS);

        let context = negotiate_extensions(&DeflateNegotiator::new(), &request, &mut response);

        assert!(context.is_none());
        assert_eq!(response.header("sec-websocket-extensions"), None);
    }

    #[test_log::test]
    fn context_reports_effective_window_sizes() {
        let context = DeflateContext {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: Some(10),
            client_max_window_bits: None,
            compression_threshold: 32,
        };

        assert_eq!(context.server_window_bits(), 10);
        assert_eq!(context.client_window_bits(), 15);
    }
}
