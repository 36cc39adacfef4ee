//! Byte relay driver.
//!
//! Drives every layer by connecting to the upstream and copying bytes both
//! ways until either side closes. TLS layers get their SNI recorded from
//! the buffered ClientHello first; the handshake itself is not terminated.

use std::io;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use interpose_layers::{
    client_hello_sni, Address, Handoff, Layer, LayerDriver, PeekSource, SniResult,
};

use super::buffered::BufferedStream;

/// TLS record header length.
const RECORD_HEADER_LEN: usize = 5;

/// Peeks spent waiting for a fragmented ClientHello.
const CLIENT_HELLO_ATTEMPTS: usize = 4;

/// Relay buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Relays a client stream to a fixed upstream.
#[derive(Debug)]
pub struct RelayDriver<S> {
    client: BufferedStream<S>,
    upstream: Address,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    bytes_to_upstream: u64,
    bytes_from_upstream: u64,
}

impl<S> RelayDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        client: BufferedStream<S>,
        upstream: Address,
        connect_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            upstream,
            connect_timeout,
            idle_timeout,
            bytes_to_upstream: 0,
            bytes_from_upstream: 0,
        }
    }

    /// Bytes relayed as (to upstream, from upstream).
    pub fn transferred(&self) -> (u64, u64) {
        (self.bytes_to_upstream, self.bytes_from_upstream)
    }

    /// Server name from the buffered ClientHello, if there is one.
    async fn sniff_server_name(&mut self) -> Option<String> {
        let mut hello = self.client.peek(RECORD_HEADER_LEN).await.ok()?;
        if hello.len() < RECORD_HEADER_LEN {
            return None;
        }

        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        let wanted = (RECORD_HEADER_LEN + record_len).min(self.client.max_peek_bytes());

        for _ in 0..CLIENT_HELLO_ATTEMPTS {
            if hello.len() >= wanted {
                break;
            }
            hello = self.client.peek(wanted).await.ok()?;
        }

        match client_hello_sni(&hello) {
            SniResult::Found(name) => Some(name),
            other => {
                debug!(result = ?other, buffered = hello.len(), "No server name in ClientHello");
                None
            }
        }
    }
}

#[async_trait]
impl<S> LayerDriver for RelayDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn client(&mut self) -> &mut dyn PeekSource {
        &mut self.client
    }

    async fn drive(&mut self, layer: &mut Layer) -> anyhow::Result<Handoff> {
        if layer.is_tls() {
            let sni = self.sniff_server_name().await;
            if let Some(tls) = layer.tls_mut() {
                debug!(sni = ?sni, "ClientHello inspected");
                tls.sni = sni;
            }
        }

        let mut upstream = connect(&self.upstream, self.connect_timeout).await?;
        debug!(upstream = %self.upstream, layer = %layer.kind(), "Connected to upstream");

        let relayed = relay(&mut self.client, &mut upstream, self.idle_timeout).await;
        self.bytes_to_upstream += relayed.to_b;
        self.bytes_from_upstream += relayed.from_b;

        debug!(
            bytes_to_upstream = relayed.to_b,
            bytes_from_upstream = relayed.from_b,
            "Relay finished"
        );
        relayed.result.context("Relay failed")?;
        Ok(Handoff::Done)
    }
}

async fn connect(upstream: &Address, connect_timeout: Duration) -> anyhow::Result<TcpStream> {
    let stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((upstream.host(), upstream.port())),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))
    .and_then(|result| result)
    .with_context(|| format!("Failed to connect to upstream {}", upstream))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Outcome of a relay: bytes moved each way, and the first error if any.
#[derive(Debug)]
pub struct Relayed {
    /// Bytes copied from `a` to `b`.
    pub to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub from_b: u64,
    pub result: io::Result<()>,
}

/// Copy bytes both ways between `a` and `b` until both directions close.
///
/// Byte counts include whatever was copied before a direction failed.
pub async fn relay<A, B>(a: &mut A, b: &mut B, idle_timeout: Option<Duration>) -> Relayed
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let ((to_b, a_result), (from_b, b_result)) = tokio::join!(
        pump(&mut a_read, &mut b_write, idle_timeout),
        pump(&mut b_read, &mut a_write, idle_timeout),
    );

    Relayed {
        to_b,
        from_b,
        result: a_result.and(b_result),
    }
}

/// Copy one direction. The count is kept even when the copy fails.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let result = copy_until_eof(reader, writer, idle_timeout, &mut total).await;
    (total, result)
}

async fn copy_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let read = match idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, reader.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))??,
            None => reader.read(&mut buf).await?,
        };

        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        *total += read as u64;
    }
    writer.shutdown().await
}
