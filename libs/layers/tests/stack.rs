//! Layer stack composition tests with scripted collaborators.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use interpose_layers::{
    Address, Channel, ConnectionContext, Handoff, HttpMode, Layer, LayerDriver, LayerEvent,
    LayerKind, LayerStack, PeekSource, Policy, RootContext, StackConfig, StackError, TlsLayer,
};
use interpose_testing::{ScriptedDriver, ScriptedPeekSource, StaticPolicy};

fn stack_with(policy: Arc<dyn Policy>, server: Address, channel: Channel) -> LayerStack {
    let context = Arc::new(ConnectionContext::new(
        42,
        "198.51.100.7:50123".parse().unwrap(),
        server,
        policy,
        channel,
    ));
    LayerStack::new(RootContext::new(context), fast_config())
}

fn fast_config() -> StackConfig {
    StackConfig {
        sniff_timeout: Duration::from_millis(200),
        retry_interval: Duration::from_millis(1),
        ..StackConfig::default()
    }
}

#[tokio::test]
async fn test_ignored_host_ends_in_raw_tcp_without_peeking() {
    let server = Address::new("internal.example", 443);
    let mut stack = stack_with(
        Arc::new(StaticPolicy::new().ignore(server.clone())),
        server,
        Channel::disconnected(),
    );
    let client = ScriptedPeekSource::new(vec![0x16, 0x03, 0x01]);
    let peeks = client.peek_counter();
    let mut driver = ScriptedDriver::new(client);

    stack.run(&mut driver).await.unwrap();

    assert_eq!(driver.driven(), &[LayerKind::RawTcp]);
    assert_eq!(peeks.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(stack.len(), 1);
}

#[tokio::test]
async fn test_tls_then_http2_by_alpn() {
    let (channel, mut events) = Channel::new(16);
    let mut stack = stack_with(
        Arc::new(StaticPolicy::new()),
        Address::new("example.com", 443),
        channel,
    );
    let client = ScriptedPeekSource::new(vec![0x16, 0x03, 0x01, 0x02, 0x00]);
    let decrypted = ScriptedPeekSource::new(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec());
    let mut driver = ScriptedDriver::new(client).with_tls_handshake(Some(&b"h2"[..]), decrypted);

    stack.run(&mut driver).await.unwrap();

    assert_eq!(
        driver.driven(),
        &[
            LayerKind::Tls(TlsLayer::intercept_both()),
            LayerKind::Http2(HttpMode::Transparent),
        ]
    );
    assert_eq!(stack.describe(), "tls -> http2");
    assert_eq!(stack.top().depth(), 2);

    let first = events.recv().await.unwrap();
    assert!(matches!(
        first,
        LayerEvent::Pushed { connection_id: 42, kind: LayerKind::Tls(_), depth: 1, .. }
    ));
    let second = events.recv().await.unwrap();
    assert!(matches!(
        second,
        LayerEvent::Pushed { kind: LayerKind::Http2(HttpMode::Transparent), depth: 2, .. }
    ));
}

#[tokio::test]
async fn test_tls_without_alpn_falls_back_to_http1() {
    let mut stack = stack_with(
        Arc::new(StaticPolicy::new()),
        Address::new("example.com", 443),
        Channel::disconnected(),
    );
    let client = ScriptedPeekSource::new(vec![0x16, 0x03, 0x03]);
    let decrypted = ScriptedPeekSource::new(b"GET / HTTP/1.1\r\n".to_vec());
    let mut driver = ScriptedDriver::new(client).with_tls_handshake(None, decrypted);

    stack.run(&mut driver).await.unwrap();

    assert_eq!(stack.top().kind(), &LayerKind::Http1(HttpMode::Transparent));
    assert_eq!(stack.top().negotiated_alpn(), None);
}

#[tokio::test]
async fn test_retries_until_bytes_arrive() {
    let mut stack = stack_with(
        Arc::new(StaticPolicy::new()),
        Address::new("example.com", 443),
        Channel::disconnected(),
    );
    let mut client = ScriptedPeekSource::arriving(vec![0x16, 0x03, 0x01], [1, 1, 1]);

    let layer = stack.advance(&mut client).await.unwrap();

    assert!(layer.is_tls());
    assert_eq!(client.peek_count(), 3);
}

#[tokio::test]
async fn test_undecidable_after_sniff_timeout() {
    let (channel, mut events) = Channel::new(4);
    let server = Address::new("example.com", 25);
    let mut stack = stack_with(Arc::new(StaticPolicy::new()), server.clone(), channel);
    let mut client = ScriptedPeekSource::arriving(vec![0x16, 0x03], [2]);

    let err = stack.advance(&mut client).await.unwrap_err();

    match err {
        StackError::Undecidable { available, waited } => {
            assert_eq!(available, 2);
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("Expected Undecidable, got {:?}", other),
    }
    assert!(stack.is_empty());
    assert_eq!(
        events.recv().await,
        Some(LayerEvent::Undecidable {
            connection_id: 42,
            server,
            available: 2,
        })
    );
}

#[tokio::test]
async fn test_peek_error_aborts_stack() {
    let mut stack = stack_with(
        Arc::new(StaticPolicy::new()),
        Address::new("example.com", 443),
        Channel::disconnected(),
    );
    let mut driver = ScriptedDriver::new(ScriptedPeekSource::failing(io::ErrorKind::UnexpectedEof));

    let err = stack.run(&mut driver).await.unwrap_err();

    assert!(err.is_io());
    assert!(driver.driven().is_empty());
}

/// Driver that hands off after every layer.
struct AlwaysDelegate(ScriptedPeekSource);

#[async_trait]
impl LayerDriver for AlwaysDelegate {
    fn client(&mut self) -> &mut dyn PeekSource {
        &mut self.0
    }

    async fn drive(&mut self, _layer: &mut Layer) -> anyhow::Result<Handoff> {
        Ok(Handoff::Delegate)
    }
}

#[tokio::test]
async fn test_depth_limit() {
    let mut stack = stack_with(
        Arc::new(StaticPolicy::new()),
        Address::new("example.com", 80),
        Channel::disconnected(),
    );
    let mut driver = AlwaysDelegate(ScriptedPeekSource::new(b"GET".to_vec()));

    let err = stack.run(&mut driver).await.unwrap_err();

    assert!(matches!(err, StackError::TooDeep { max_depth: 8 }));
    assert_eq!(stack.len(), 8);
}

/// Driver whose layers always fail.
struct Broken(ScriptedPeekSource);

#[async_trait]
impl LayerDriver for Broken {
    fn client(&mut self) -> &mut dyn PeekSource {
        &mut self.0
    }

    async fn drive(&mut self, _layer: &mut Layer) -> anyhow::Result<Handoff> {
        anyhow::bail!("upstream refused connection")
    }
}

#[tokio::test]
async fn test_driver_error_aborts_stack() {
    let mut stack = stack_with(
        Arc::new(StaticPolicy::new()),
        Address::new("example.com", 80),
        Channel::disconnected(),
    );
    let mut driver = Broken(ScriptedPeekSource::new(b"GET".to_vec()));

    let err = stack.run(&mut driver).await.unwrap_err();

    assert!(matches!(err, StackError::Driver(_)));
    assert_eq!(stack.top().kind(), &LayerKind::Http1(HttpMode::Transparent));
}
