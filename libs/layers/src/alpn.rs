//! ALPN-based HTTP version selection.

use crate::layer::{HttpMode, LayerKind};

/// ALPN protocol identifier for HTTP/2 over TLS.
pub const ALPN_HTTP2: &[u8] = b"h2";

/// ALPN protocol identifier for HTTP/1.1.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Pick the HTTP layer matching a negotiated ALPN protocol.
///
/// Returns `None` when nothing was negotiated or the protocol is not an
/// HTTP version this proxy speaks; the caller falls back to its default.
pub fn select_http_layer(alpn: Option<&[u8]>) -> Option<LayerKind> {
    match alpn? {
        ALPN_HTTP2 => Some(LayerKind::Http2(HttpMode::Transparent)),
        ALPN_HTTP1 => Some(LayerKind::Http1(HttpMode::Transparent)),
        _ => None,
    }
}
