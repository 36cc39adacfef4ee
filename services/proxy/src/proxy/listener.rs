//! TCP listener and connection handling.
//!
//! Every accepted connection gets its own context and layer stack. The
//! stack picks layers from sniffed client bytes and host policy; the
//! [`RelayDriver`] runs them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use interpose_layers::{
    Address, Channel, ConnectionContext, LayerStack, Policy, RootContext, StackConfig, StackError,
};

use super::buffered::{BufferedStream, DEFAULT_MAX_PEEK_BYTES, DEFAULT_PEEK_TIMEOUT};
use super::relay::RelayDriver;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Server every connection is relayed to.
    pub upstream: Address,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Layer stack limits.
    pub stack: StackConfig,
    /// Time a single peek waits for more client bytes.
    pub peek_timeout: Duration,
    /// Maximum client bytes buffered for sniffing.
    pub max_peek_bytes: usize,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
    /// Idle timeout for relayed connections.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, upstream: Address) -> Self {
        Self {
            bind_addr,
            upstream,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            stack: StackConfig::default(),
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            max_peek_bytes: DEFAULT_MAX_PEEK_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections that ended with an error.
    pub connections_failed: AtomicU64,
    /// TLS layers pushed.
    pub layers_tls: AtomicU64,
    /// Raw TCP layers pushed.
    pub layers_raw_tcp: AtomicU64,
    /// HTTP/1 layers pushed.
    pub layers_http1: AtomicU64,
    /// HTTP/2 layers pushed.
    pub layers_http2: AtomicU64,
    /// Connections that never sent enough bytes to pick a layer.
    pub undecidable: AtomicU64,
    /// Bytes relayed to the upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed from the upstream.
    pub bytes_from_upstream: AtomicU64,
}

/// A TCP listener for the intercepting proxy.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    policy: Arc<dyn Policy>,
    channel: Channel,
    conn_semaphore: Arc<Semaphore>,
    next_connection_id: AtomicU64,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        policy: Arc<dyn Policy>,
        channel: Channel,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            upstream = %config.upstream,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            policy,
            channel,
            next_connection_id: AtomicU64::new(1),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener
                                .handle_connection(stream, peer_addr, connection_id)
                                .await
                            {
                                stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                                if !e.is_undecidable() {
                                    debug!(error = %e, "Connection error");
                                }
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            id = connection_id,
                            peer = %peer_addr
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
        connection_id: u64,
    ) -> Result<(), StackError> {
        debug!(upstream = %self.config.upstream, "Handling connection");

        let context = Arc::new(ConnectionContext::new(
            connection_id,
            peer_addr,
            self.config.upstream.clone(),
            Arc::clone(&self.policy),
            self.channel.clone(),
        ));
        let mut stack = LayerStack::new(RootContext::new(context), self.config.stack.clone());

        let client = BufferedStream::with_limits(
            client,
            self.config.peek_timeout,
            self.config.max_peek_bytes,
        );
        let mut driver = RelayDriver::new(
            client,
            self.config.upstream.clone(),
            self.config.connect_timeout,
            self.config.idle_timeout,
        );

        let result = stack.run(&mut driver).await;

        let (to_upstream, from_upstream) = driver.transferred();
        self.stats
            .bytes_to_upstream
            .fetch_add(to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(from_upstream, Ordering::Relaxed);

        result?;
        debug!(
            stack = %stack.describe(),
            bytes_to_upstream = to_upstream,
            bytes_from_upstream = from_upstream,
            "Connection closed"
        );
        Ok(())
    }
}
