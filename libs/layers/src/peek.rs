//! Non-consuming access to the client side of a connection.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

/// A client stream that can be inspected without advancing its cursor.
#[async_trait]
pub trait PeekSource: Send {
    /// Return up to `n` bytes from the front of the stream without
    /// consuming them.
    ///
    /// May return fewer than `n` bytes when they have not arrived yet.
    /// Implementations may suspend while waiting for data, bounded by their
    /// own read timeout. A stream that closed before `n` bytes arrived is
    /// reported as an error, not as a short read.
    async fn peek(&mut self, n: usize) -> io::Result<Bytes>;
}

