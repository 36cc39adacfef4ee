//! Layer model: the closed set of protocol layers and their shared context.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::address::Address;
use crate::channel::Channel;
use crate::policy::Policy;

/// State shared by every layer of one connection.
///
/// Read-only after construction. Layers hold it through an `Arc` instead of
/// resolving attributes through the layer that created them.
pub struct ConnectionContext {
    id: u64,
    client_addr: SocketAddr,
    server: Address,
    policy: Arc<dyn Policy>,
    channel: Channel,
}

impl ConnectionContext {
    /// Create the context for a newly accepted connection.
    pub fn new(
        id: u64,
        client_addr: SocketAddr,
        server: Address,
        policy: Arc<dyn Policy>,
        channel: Channel,
    ) -> Self {
        Self {
            id,
            client_addr,
            server,
            policy,
            channel,
        }
    }

    /// Connection ID, unique per listener.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the connecting client.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// The upstream server the client intends to reach.
    pub fn server(&self) -> &Address {
        &self.server
    }

    /// Interception policy.
    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    /// Channel to the controlling master.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// Operating mode of an HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HttpMode {
    /// Forward to the address the client originally targeted.
    Transparent,
}

/// Configuration and handshake results of a TLS layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsLayer {
    /// Terminate TLS towards the client.
    pub client_tls: bool,
    /// Establish TLS towards the server.
    pub server_tls: bool,
    /// Application protocol negotiated with the client, once the handshake
    /// completed.
    pub negotiated_alpn: Option<Bytes>,
    /// Server name from the ClientHello, if the driver extracted one.
    pub sni: Option<String>,
}

impl TlsLayer {
    /// A TLS layer intercepting both the client and the server side.
    pub fn intercept_both() -> Self {
        Self {
            client_tls: true,
            server_tls: true,
            negotiated_alpn: None,
            sni: None,
        }
    }
}

/// The protocol a layer processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    /// Placeholder at the bottom of every stack.
    Root,
    /// Raw TCP relay, owns the connection until close.
    RawTcp,
    /// TLS interception.
    Tls(TlsLayer),
    /// HTTP/1.x.
    Http1(HttpMode),
    /// HTTP/2.
    Http2(HttpMode),
}

impl LayerKind {
    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Root => "root",
            LayerKind::RawTcp => "rawtcp",
            LayerKind::Tls(_) => "tls",
            LayerKind::Http1(_) => "http1",
            LayerKind::Http2(_) => "http2",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of a connection's layer stack.
#[derive(Debug, Clone)]
pub struct Layer {
    kind: LayerKind,
    depth: usize,
    context: Arc<ConnectionContext>,
}

impl Layer {
    /// The root placeholder for a new connection.
    pub fn root(context: Arc<ConnectionContext>) -> Self {
        Self {
            kind: LayerKind::Root,
            depth: 0,
            context,
        }
    }

    /// A new layer bound to `parent`, sharing its connection context.
    pub fn on_top_of(parent: &Layer, kind: LayerKind) -> Self {
        Self {
            kind,
            depth: parent.depth + 1,
            context: Arc::clone(&parent.context),
        }
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    /// Position in the stack, 0 for the root placeholder.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.kind, LayerKind::Tls(_))
    }

    /// TLS state, if this is a TLS layer.
    pub fn tls(&self) -> Option<&TlsLayer> {
        match &self.kind {
            LayerKind::Tls(tls) => Some(tls),
            _ => None,
        }
    }

    /// Mutable TLS state, for the driver recording handshake results.
    pub fn tls_mut(&mut self) -> Option<&mut TlsLayer> {
        match &mut self.kind {
            LayerKind::Tls(tls) => Some(tls),
            _ => None,
        }
    }

    /// ALPN protocol negotiated by a completed TLS layer.
    ///
    /// Always `None` for other layer kinds.
    pub fn negotiated_alpn(&self) -> Option<&[u8]> {
        self.tls().and_then(|tls| tls.negotiated_alpn.as_deref())
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    pub fn server(&self) -> &Address {
        self.context.server()
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.context.client_addr()
    }

    pub fn policy(&self) -> &dyn Policy {
        self.context.policy()
    }

    pub fn channel(&self) -> &Channel {
        self.context.channel()
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.depth == other.depth
            && Arc::ptr_eq(&self.context, &other.context)
    }
}

impl Eq for Layer {}
