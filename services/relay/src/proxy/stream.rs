//! Connection types.
//!
//! A connection is any full-duplex async byte stream. Replacing one (after
//! sniffing or handler matching) moves the old value into its wrapper, so the
//! old handle can never be used again.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use plfm_sniff::Prefixed;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A full-duplex byte stream the relay can own.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Type-erased connection handed between the listener, handlers and the
/// forwarding engine.
pub type BoxedConn = Box<dyn Connection>;

/// Recording reader used while handler factories try to match a connection.
///
/// Every byte read from the inner stream is recorded. The registry rewinds
/// the cursor before each factory attempt, so each factory sees the
/// connection from its first byte. Only [`AsyncRead`] is implemented: a
/// factory can look, but cannot write to or close the connection.
pub struct Rewind<S> {
    inner: S,
    recorded: BytesMut,
    pos: usize,
}

impl<S> Rewind<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            recorded: BytesMut::new(),
            pos: 0,
        }
    }

    /// Bytes read so far by the current reader.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Move the read cursor back to the start of the stream.
    pub(crate) fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Stop recording and hand the stream on.
    ///
    /// With `replay` the next reader starts from the first byte. Without it
    /// the bytes consumed by the current reader are dropped; bytes recorded
    /// beyond the cursor are still delivered.
    pub(crate) fn into_prefixed(self, replay: bool) -> Prefixed<S> {
        let mut recorded = self.recorded;
        if !replay {
            recorded.advance(self.pos);
        }
        Prefixed::new(recorded.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.pos < this.recorded.len() {
            let n = (this.recorded.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.recorded[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        this.recorded.extend_from_slice(fresh);
        this.pos += fresh.len();

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_replays_from_start() {
        let (mut remote, local) = tokio::io::duplex(64);
        remote.write_all(b"hello world").await.unwrap();

        let mut stream = Rewind::new(local);
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(stream.consumed(), 5);

        stream.rewind();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_into_prefixed_with_replay() {
        let (mut remote, local) = tokio::io::duplex(64);
        remote.write_all(b"abcdef").await.unwrap();

        let mut stream = Rewind::new(local);
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();

        let mut next = stream.into_prefixed(true);
        drop(remote);
        let mut out = Vec::new();
        next.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn test_into_prefixed_without_replay_keeps_unconsumed() {
        let (mut remote, local) = tokio::io::duplex(64);
        remote.write_all(b"abcdef").await.unwrap();

        let mut stream = Rewind::new(local);
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();

        // A second reader only looks at the first two bytes
        stream.rewind();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();

        let mut next = stream.into_prefixed(false);
        drop(remote);
        let mut out = Vec::new();
        next.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cdef");
    }
}
