//! Per-connection layer stack.
//!
//! The stack only grows. Each active layer, once ready to hand off, asks the
//! dispatcher for the next layer with itself as the current top and then
//! delegates to it. A layer is never re-entered after it delegated.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::channel::LayerEvent;
use crate::dispatcher::{Dispatch, RootContext};
use crate::error::StackError;
use crate::layer::Layer;
use crate::peek::PeekSource;

/// Default time to wait for enough client bytes to pick a layer.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between dispatch attempts while bytes are missing.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Default maximum number of layers above the root placeholder.
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// Stack construction limits.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Total time a single transition may wait for sniffable bytes.
    pub sniff_timeout: Duration,
    /// Pause between dispatch attempts while the decision is pending.
    pub retry_interval: Duration,
    /// Maximum number of layers above the root placeholder.
    pub max_depth: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// What a layer does once its driver returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The layer finished negotiating; ask the dispatcher for the next one.
    Delegate,
    /// The layer owned the stream until the connection closed.
    Done,
}

/// Runs layers on behalf of the stack.
///
/// Implemented by the protocol collaborators (TLS termination, HTTP
/// handling, raw relay). The driver owns the connection's streams, so after
/// a TLS handshake [`client`](LayerDriver::client) returns the decrypted
/// side.
#[async_trait]
pub trait LayerDriver: Send {
    /// The client stream as seen by the current top layer.
    fn client(&mut self) -> &mut dyn PeekSource;

    /// Run `layer` until it hands off or the connection ends.
    ///
    /// Handshake results (negotiated ALPN, SNI) are recorded on `layer`
    /// before returning [`Handoff::Delegate`].
    async fn drive(&mut self, layer: &mut Layer) -> anyhow::Result<Handoff>;
}

/// The ordered layers of one connection.
#[derive(Debug)]
pub struct LayerStack {
    root: RootContext,
    root_layer: Layer,
    layers: Vec<Layer>,
    config: StackConfig,
}

impl LayerStack {
    /// Create a stack holding only the root placeholder.
    pub fn new(root: RootContext, config: StackConfig) -> Self {
        Self {
            root_layer: root.root_layer(),
            root,
            layers: Vec::new(),
            config,
        }
    }

    /// The current top layer.
    pub fn top(&self) -> &Layer {
        self.layers.last().unwrap_or(&self.root_layer)
    }

    /// The current top layer, for recording handshake results.
    pub fn top_mut(&mut self) -> &mut Layer {
        match self.layers.last_mut() {
            Some(layer) => layer,
            None => &mut self.root_layer,
        }
    }

    /// Number of layers above the root placeholder.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names bottom to top, for logging.
    pub fn describe(&self) -> String {
        self.layers
            .iter()
            .map(|layer| layer.kind().name())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Ask the dispatcher for the next layer and push it.
    ///
    /// Retries while the decision is pending, for at most
    /// [`StackConfig::sniff_timeout`].
    pub async fn advance(&mut self, client: &mut dyn PeekSource) -> Result<&Layer, StackError> {
        if self.top().depth() >= self.config.max_depth {
            return Err(StackError::TooDeep {
                max_depth: self.config.max_depth,
            });
        }

        let started = Instant::now();
        let mut available = 0;

        let layer = loop {
            let remaining = self.config.sniff_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(self.undecidable(available, started.elapsed()));
            }

            let attempt = tokio::time::timeout(remaining, self.root.next_layer(self.top(), client));
            match attempt.await {
                Ok(Ok(Dispatch::Next(layer))) => break layer,
                Ok(Ok(Dispatch::Pending { available: seen })) => {
                    available = seen;
                    tokio::time::sleep(self.config.retry_interval.min(remaining)).await;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(self.undecidable(available, started.elapsed())),
            }
        };

        let context = layer.context();
        debug!(
            connection_id = context.id(),
            server = %context.server(),
            layer = %layer.kind(),
            depth = layer.depth(),
            "Layer pushed"
        );
        context.channel().tell(LayerEvent::Pushed {
            connection_id: context.id(),
            server: context.server().clone(),
            kind: layer.kind().clone(),
            depth: layer.depth(),
        });

        self.layers.push(layer);
        Ok(self.top())
    }

    /// Build and run the stack until a layer owns the connection.
    pub async fn run(&mut self, driver: &mut dyn LayerDriver) -> Result<(), StackError> {
        loop {
            self.advance(driver.client()).await?;

            let handoff = driver
                .drive(self.top_mut())
                .await
                .map_err(StackError::Driver)?;

            if handoff == Handoff::Done {
                debug!(stack = %self.describe(), "Layer stack finished");
                return Ok(());
            }
        }
    }

    fn undecidable(&self, available: usize, waited: Duration) -> StackError {
        let context = self.root.context();
        warn!(
            connection_id = context.id(),
            server = %context.server(),
            available,
            ?waited,
            "Gave up waiting for bytes to pick a layer"
        );
        context.channel().tell(LayerEvent::Undecidable {
            connection_id: context.id(),
            server: context.server().clone(),
            available,
        });
        StackError::Undecidable { available, waited }
    }
}
