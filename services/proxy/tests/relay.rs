
use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use harness::{client_hello, eventually, ProxyHandle, TcpEchoBackend};
use interpose_layers::{
    Address, Channel, ConnectionContext, Handoff, HttpMode, Layer, LayerDriver, LayerKind,
    NoPolicy, TlsLayer,
};
use interpose_proxy::{BufferedStream, HostPolicy, RelayDriver};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Send `payload`, half-close, and read back everything the proxy returns.
async fn round_trip(proxy: &ProxyHandle, payload: &[u8]) -> Vec<u8> {
    timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(proxy.listen_addr).await?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    })
    .await
    .expect("round trip timed out")
    .expect("round trip failed")
}

#[tokio::test]
async fn plaintext_defaults_to_http1_and_is_relayed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(backend.address(), HostPolicy::empty())
        .await
        .unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let response = round_trip(&proxy, request).await;

    assert_eq!(response, request);
    assert!(eventually(|| proxy.count(|s| &s.layers_http1) == 1).await);
    assert_eq!(proxy.count(|s| &s.layers_raw_tcp), 0);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn plaintext_to_tcp_passthrough_host_is_raw_tcp() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let policy = HostPolicy::new(Vec::<String>::new(), [r"^127\.0\.0\.1:"]).unwrap();
    let proxy = ProxyHandle::spawn(backend.address(), policy).await.unwrap();

    let response = round_trip(&proxy, b"GET / HTTP/1.1\r\n\r\n").await;

    assert_eq!(response, b"GET / HTTP/1.1\r\n\r\n");
    assert!(eventually(|| proxy.count(|s| &s.layers_raw_tcp) == 1).await);
    assert_eq!(proxy.count(|s| &s.layers_http1), 0);
}

#[tokio::test]
async fn tls_is_intercepted_even_for_tcp_passthrough_host() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let policy = HostPolicy::new(Vec::<String>::new(), [r"^127\.0\.0\.1:"]).unwrap();
    let proxy = ProxyHandle::spawn(backend.address(), policy).await.unwrap();

    let hello = client_hello("example.com");
    let response = round_trip(&proxy, &hello).await;

    assert_eq!(response, hello);
    assert!(eventually(|| proxy.count(|s| &s.layers_tls) == 1).await);
    assert_eq!(proxy.count(|s| &s.layers_raw_tcp), 0);
}

#[tokio::test]
async fn ignored_host_is_relayed_without_sniffing() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let policy = HostPolicy::new([r"^127\.0\.0\.1:"], Vec::<String>::new()).unwrap();
    let proxy = ProxyHandle::spawn(backend.address(), policy).await.unwrap();

    let hello = client_hello("example.com");
    let response = round_trip(&proxy, &hello).await;

    assert_eq!(response, hello);
    assert!(eventually(|| proxy.count(|s| &s.layers_raw_tcp) == 1).await);
    assert_eq!(proxy.count(|s| &s.layers_tls), 0);
}

#[tokio::test]
async fn policy_replacement_applies_to_new_connections() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(backend.address(), HostPolicy::empty())
        .await
        .unwrap();

    round_trip(&proxy, b"GET / HTTP/1.1\r\n\r\n").await;
    assert!(eventually(|| proxy.count(|s| &s.layers_http1) == 1).await);

    proxy
        .policy
        .replace(HostPolicy::new([r"^127\.0\.0\.1:"], Vec::<String>::new()).unwrap());

    round_trip(&proxy, b"GET / HTTP/1.1\r\n\r\n").await;
    assert!(eventually(|| proxy.count(|s| &s.layers_raw_tcp) == 1).await);
    assert_eq!(proxy.count(|s| &s.layers_http1), 1);
}

#[tokio::test]
async fn silent_client_is_undecidable_and_closed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn_with(backend.address(), HostPolicy::empty(), |config| {
        config.stack.sniff_timeout = Duration::from_millis(200);
    })
    .await
    .unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(TEST_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("proxy should close the connection");

    // Either an orderly close or a reset, but never data.
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(eventually(|| proxy.count(|s| &s.undecidable) == 1).await);
    assert!(eventually(|| proxy.count(|s| &s.connections_failed) == 1).await);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn unreachable_upstream_fails_connection() {
    // Bind and drop to get a port with nothing listening.
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream = Address::from(closed.local_addr().unwrap());
    drop(closed);

    let proxy = ProxyHandle::spawn(upstream, HostPolicy::empty())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let _ = stream.shutdown().await;

    let mut response = Vec::new();
    let read = timeout(TEST_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("proxy should close the connection");

    assert!(read.is_err() || response.is_empty());
    assert!(eventually(|| proxy.count(|s| &s.connections_failed) == 1).await);
    assert!(eventually(|| proxy.count(|s| &s.connections_closed) == 1).await);
}

#[tokio::test]
async fn idle_connection_fails_with_bytes_counted() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn_with(backend.address(), HostPolicy::empty(), |config| {
        config.idle_timeout = Some(Duration::from_millis(100));
    })
    .await
    .unwrap();

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"ping");

    // Stay open without sending so the relay ends on its idle timeout.
    assert!(eventually(|| proxy.count(|s| &s.connections_failed) == 1).await);
    assert_eq!(proxy.count(|s| &s.bytes_to_upstream), 4);
    assert_eq!(proxy.count(|s| &s.bytes_from_upstream), 4);
    drop(stream);
}

#[tokio::test]
async fn relay_driver_records_sni_on_tls_layer() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let (mut client, proxy_side) = tokio::io::duplex(16 * 1024);

    let hello = client_hello("WWW.Example.COM.");
    client.write_all(&hello).await.unwrap();
    client.shutdown().await.unwrap();

    let context = Arc::new(ConnectionContext::new(
        1,
        "192.0.2.1:40000".parse().unwrap(),
        backend.address(),
        Arc::new(NoPolicy),
        Channel::disconnected(),
    ));
    let mut layer = Layer::on_top_of(
        &Layer::root(context),
        LayerKind::Tls(TlsLayer::intercept_both()),
    );

    let mut driver = RelayDriver::new(
        BufferedStream::new(proxy_side),
        backend.address(),
        Duration::from_secs(1),
        None,
    );
    let handoff = timeout(TEST_TIMEOUT, driver.drive(&mut layer))
        .await
        .expect("drive timed out")
        .unwrap();

    assert_eq!(handoff, Handoff::Done);
    assert_eq!(
        layer.tls().and_then(|tls| tls.sni.as_deref()),
        Some("www.example.com")
    );
    assert_eq!(driver.transferred(), (hello.len() as u64, hello.len() as u64));

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, hello);
}

/// A client stream that can move between threads but is not `Sync`.
struct SendOnly {
    inner: DuplexStream,
    _not_sync: PhantomData<Cell<()>>,
}

impl AsyncRead for SendOnly {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SendOnly {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn relay_driver_runs_on_spawned_task_with_non_sync_stream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = Address::from(upstream.local_addr().unwrap());
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await?;
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await?;
        stream.shutdown().await?;
        Ok::<_, io::Error>(received)
    });

    let (mut client, proxy_side) = tokio::io::duplex(1024);
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();

    let context = Arc::new(ConnectionContext::new(
        1,
        "192.0.2.1:40000".parse().unwrap(),
        upstream_addr.clone(),
        Arc::new(NoPolicy),
        Channel::disconnected(),
    ));
    let mut layer = Layer::on_top_of(
        &Layer::root(context),
        LayerKind::Http1(HttpMode::Transparent),
    );
    let mut driver = RelayDriver::new(
        BufferedStream::new(SendOnly {
            inner: proxy_side,
            _not_sync: PhantomData,
        }),
        upstream_addr,
        Duration::from_secs(1),
        None,
    );

    // The drive future has to be Send to be spawned.
    let drive_task = tokio::spawn(async move {
        let handoff = driver.drive(&mut layer).await;
        (handoff.map_err(|e| e.to_string()), driver.transferred())
    });

    let (handoff, transferred) = timeout(TEST_TIMEOUT, drive_task)
        .await
        .expect("drive timed out")
        .unwrap();
    assert_eq!(handoff, Ok(Handoff::Done));
    assert_eq!(transferred, (18, 0));
    assert_eq!(upstream_task.await.unwrap().unwrap(), b"GET / HTTP/1.1\r\n\r\n");
}
