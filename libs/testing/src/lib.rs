//! Test doubles for interpose layer dispatch.
//!
//! - [`ScriptedPeekSource`]: a client stream whose bytes arrive in scripted chunks
//! - [`StaticPolicy`] / [`FailingPolicy`]: fixed host policies
//! - [`ScriptedDriver`]: a layer driver standing in for the TLS and HTTP collaborators

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use interpose_layers::{
    Address, Handoff, Layer, LayerDriver, LayerKind, PeekSource, Policy, PolicyError,
};

/// Client stream with scripted byte arrival.
///
/// Every `peek` that finds fewer bytes than requested lets the next scripted
/// chunk "arrive" before answering.
#[derive(Debug, Clone)]
pub struct ScriptedPeekSource {
    data: Vec<u8>,
    visible: usize,
    arrivals: VecDeque<usize>,
    error: Option<io::ErrorKind>,
    peeks: Arc<AtomicUsize>,
}

impl ScriptedPeekSource {
    /// All of `data` is available immediately.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            visible: data.len(),
            data,
            arrivals: VecDeque::new(),
            error: None,
            peeks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `data` arrives in chunks of the given sizes, one per short peek.
    pub fn arriving(data: impl Into<Vec<u8>>, chunks: impl IntoIterator<Item = usize>) -> Self {
        Self {
            visible: 0,
            arrivals: chunks.into_iter().collect(),
            ..Self::new(data)
        }
    }

    /// A client that never sends anything.
    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    /// Every peek fails with `kind`.
    pub fn failing(kind: io::ErrorKind) -> Self {
        Self {
            error: Some(kind),
            ..Self::silent()
        }
    }

    /// Number of `peek` calls so far.
    pub fn peek_count(&self) -> usize {
        self.peeks.load(Ordering::SeqCst)
    }

    /// Shared counter of `peek` calls, readable after the source moved.
    pub fn peek_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peeks)
    }
}

#[async_trait]
impl PeekSource for ScriptedPeekSource {
    async fn peek(&mut self, n: usize) -> io::Result<Bytes> {
        self.peeks.fetch_add(1, Ordering::SeqCst);

        if let Some(kind) = self.error {
            return Err(io::Error::from(kind));
        }

        if self.visible < n {
            if let Some(chunk) = self.arrivals.pop_front() {
                self.visible = (self.visible + chunk).min(self.data.len());
            }
        }

        let end = n.min(self.visible);
        Ok(Bytes::copy_from_slice(&self.data[..end]))
    }
}

/// Policy with fixed ignore and TCP passthrough host sets.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    ignore: HashSet<Address>,
    tcp: HashSet<Address>,
    ignore_checks: AtomicUsize,
    tcp_checks: AtomicUsize,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay traffic to `server` untouched.
    pub fn ignore(mut self, server: Address) -> Self {
        self.ignore.insert(server);
        self
    }

    /// Relay non-TLS traffic to `server` as raw TCP.
    pub fn passthrough_tcp(mut self, server: Address) -> Self {
        self.tcp.insert(server);
        self
    }

    /// Number of `should_passthrough_tcp` evaluations so far.
    pub fn tcp_checks(&self) -> usize {
        self.tcp_checks.load(Ordering::SeqCst)
    }

    /// Number of `should_ignore` evaluations so far.
    pub fn ignore_checks(&self) -> usize {
        self.ignore_checks.load(Ordering::SeqCst)
    }
}

impl Policy for StaticPolicy {
    fn should_ignore(&self, server: &Address) -> Result<bool, PolicyError> {
        self.ignore_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.ignore.contains(server))
    }

    fn should_passthrough_tcp(&self, server: &Address) -> Result<bool, PolicyError> {
        self.tcp_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.tcp.contains(server))
    }
}

/// Policy whose predicates fail.
#[derive(Debug)]
pub struct FailingPolicy {
    ignore_fails: bool,
}

impl FailingPolicy {
    /// Both predicates fail.
    pub fn new() -> Self {
        Self { ignore_fails: true }
    }

    /// Only `should_passthrough_tcp` fails; no host is ignored.
    pub fn passthrough_only() -> Self {
        Self {
            ignore_fails: false,
        }
    }
}

impl Default for FailingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for FailingPolicy {
    fn should_ignore(&self, _server: &Address) -> Result<bool, PolicyError> {
        if !self.ignore_fails {
            return Ok(false);
        }
        Err(PolicyError::Evaluation("ignore lookup unavailable".to_string()))
    }

    fn should_passthrough_tcp(&self, _server: &Address) -> Result<bool, PolicyError> {
        Err(PolicyError::Evaluation("tcp lookup unavailable".to_string()))
    }
}

/// Layer driver that fakes the TLS handshake and owns the stream for every
/// other layer.
///
/// A TLS layer records the scripted ALPN, switches the client stream to the
/// scripted "decrypted" source and delegates. Any other layer is terminal.
#[derive(Debug)]
pub struct ScriptedDriver {
    client: ScriptedPeekSource,
    decrypted: Option<ScriptedPeekSource>,
    alpn: Option<Bytes>,
    driven: Vec<LayerKind>,
}

impl ScriptedDriver {
    pub fn new(client: ScriptedPeekSource) -> Self {
        Self {
            client,
            decrypted: None,
            alpn: None,
            driven: Vec::new(),
        }
    }

    /// Complete TLS handshakes with `alpn`, exposing `decrypted` afterwards.
    pub fn with_tls_handshake(
        mut self,
        alpn: Option<&'static [u8]>,
        decrypted: ScriptedPeekSource,
    ) -> Self {
        self.alpn = alpn.map(Bytes::from_static);
        self.decrypted = Some(decrypted);
        self
    }

    /// Kinds of the layers driven so far, in order.
    pub fn driven(&self) -> &[LayerKind] {
        &self.driven
    }
}

#[async_trait]
impl LayerDriver for ScriptedDriver {
    fn client(&mut self) -> &mut dyn PeekSource {
        &mut self.client
    }

    async fn drive(&mut self, layer: &mut Layer) -> anyhow::Result<Handoff> {
        self.driven.push(layer.kind().clone());

        let Some(tls) = layer.tls_mut() else {
            return Ok(Handoff::Done);
        };

        tls.negotiated_alpn = self.alpn.clone();
        if let Some(decrypted) = self.decrypted.take() {
            self.client = decrypted;
        }
        Ok(Handoff::Delegate)
    }
}
