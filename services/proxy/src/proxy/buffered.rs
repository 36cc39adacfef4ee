//! Client stream with a replayable read-ahead buffer.
//!
//! Peeked bytes are kept in the buffer and handed out again by `AsyncRead`
//! before anything new is read from the socket, so sniffing never loses
//! client data.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::trace;

use interpose_layers::PeekSource;

/// Default time a single peek waits for more client bytes.
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_millis(200);

/// Default maximum bytes held for peeking (8KB).
pub const DEFAULT_MAX_PEEK_BYTES: usize = 8192;

/// A stream that supports non-consuming peeks.
#[derive(Debug)]
pub struct BufferedStream<S> {
    inner: S,
    buffer: BytesMut,
    peek_timeout: Duration,
    max_peek_bytes: usize,
}

impl<S> BufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_limits(inner, DEFAULT_PEEK_TIMEOUT, DEFAULT_MAX_PEEK_BYTES)
    }

    pub fn with_limits(inner: S, peek_timeout: Duration, max_peek_bytes: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            peek_timeout,
            max_peek_bytes,
        }
    }

    /// Bytes read ahead and not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn max_peek_bytes(&self) -> usize {
        self.max_peek_bytes
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S> PeekSource for BufferedStream<S>
where
    S: AsyncRead + Unpin + Send,
{
    async fn peek(&mut self, n: usize) -> io::Result<Bytes> {
        let n = n.min(self.max_peek_bytes);

        if self.buffer.len() < n {
            // Read whatever is available up to the limit, not just `n`, so
            // the socket is drained of what the client already sent.
            self.buffer
                .reserve(self.max_peek_bytes.saturating_sub(self.buffer.len()));
            match timeout(self.peek_timeout, self.inner.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "client closed after {} of {} byte(s)",
                            self.buffer.len(),
                            n
                        ),
                    ));
                }
                Ok(Ok(read)) => trace!(read, buffered = self.buffer.len(), "Read ahead"),
                Ok(Err(e)) => return Err(e),
                Err(_) => trace!(buffered = self.buffer.len(), wanted = n, "Peek timed out"),
            }
        }

        let end = n.min(self.buffer.len());
        Ok(Bytes::copy_from_slice(&self.buffer[..end]))
    }
}

impl<S> AsyncRead for BufferedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.buffer.is_empty() {
            let len = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..len]);
            this.buffer.advance(len);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for BufferedStream<S>
where
    S: AsyncWrite + Unpin,
{
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
