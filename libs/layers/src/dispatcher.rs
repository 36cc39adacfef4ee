//! Next-layer decision for a connection's layer stack.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::alpn::select_http_layer;
use crate::error::DispatchError;
use crate::layer::{ConnectionContext, HttpMode, Layer, LayerKind, TlsLayer};
use crate::peek::PeekSource;
use crate::sniff::{classify_tls, TlsSniff, TLS_SNIFF_LEN};

/// Outcome of a single dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The layer to push next.
    Next(Layer),
    /// Too few client bytes to decide yet. Retry once more have arrived.
    Pending { available: usize },
}

impl Dispatch {
    /// The chosen layer, if the decision was made.
    pub fn layer(self) -> Option<Layer> {
        match self {
            Dispatch::Next(layer) => Some(layer),
            Dispatch::Pending { .. } => None,
        }
    }
}

/// The outermost context of a connection, deciding which layer comes next.
///
/// Holds no mutable state. Every input is either the connection context,
/// the current top layer or the peeked client bytes.
#[derive(Debug, Clone)]
pub struct RootContext {
    context: Arc<ConnectionContext>,
}

impl RootContext {
    pub fn new(context: Arc<ConnectionContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    /// The placeholder layer every stack starts with.
    pub fn root_layer(&self) -> Layer {
        Layer::root(Arc::clone(&self.context))
    }

    /// Decide the layer to push on top of `top`.
    ///
    /// `client` is the client-side stream as seen by `top` (decrypted for a
    /// TLS layer). It is only peeked, never consumed.
    ///
    /// `top` is expected to belong to this connection. Server and policy are
    /// always taken from this root's context; only the TLS state and depth
    /// of `top` are consulted.
    pub async fn next_layer(
        &self,
        top: &Layer,
        client: &mut dyn PeekSource,
    ) -> Result<Dispatch, DispatchError> {
        let server = self.context.server();
        let policy = self.context.policy();

        // 1. Ignored hosts are relayed without looking at a single byte.
        if policy.should_ignore(server)? {
            debug!(%server, "Host ignored, relaying raw TCP");
            return Ok(Dispatch::Next(Layer::on_top_of(top, LayerKind::RawTcp)));
        }

        // 2. TLS ClientHello (SSLv3 to TLS 1.2 record header).
        let peeked = client.peek(TLS_SNIFF_LEN).await?;
        match classify_tls(&peeked) {
            TlsSniff::Insufficient { available } => {
                trace!(%server, available, "Not enough bytes to sniff");
                return Ok(Dispatch::Pending { available });
            }
            TlsSniff::ClientHello { minor } => {
                debug!(%server, minor, "TLS ClientHello detected");
                return Ok(Dispatch::Next(Layer::on_top_of(
                    top,
                    LayerKind::Tls(TlsLayer::intercept_both()),
                )));
            }
            TlsSniff::NotTls => {}
        }

        // 3. TCP passthrough, only for traffic that is not TLS.
        if policy.should_passthrough_tcp(server)? {
            debug!(%server, "TCP passthrough host, relaying raw TCP");
            return Ok(Dispatch::Next(Layer::on_top_of(top, LayerKind::RawTcp)));
        }

        // 4. HTTP version negotiated by the TLS layer below.
        if top.is_tls() {
            if let Some(kind) = select_http_layer(top.negotiated_alpn()) {
                debug!(%server, layer = %kind, "Selected by ALPN");
                return Ok(Dispatch::Next(Layer::on_top_of(top, kind)));
            }
        }

        // 5. HTTP/1 by default.
        Ok(Dispatch::Next(Layer::on_top_of(
            top,
            LayerKind::Http1(HttpMode::Transparent),
        )))
    }
}
