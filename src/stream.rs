//! Buffered byte stream with an *unrecv* head buffer.
//!
//! [`BufferedStream`] wraps a duplex byte stream and keeps a head buffer
//! that reads consume before touching the underlying socket. Residual bytes
//! after the last complete control frame are pushed back with
//! [`BufferedStream::unrecv`]; when a connection switches from framed JSON
//! to raw streaming, whatever is left in the head belongs to the raw session
//! and is drained first ([`BufferedStream::take_head`], or transparently via
//! the `AsyncRead` impl).
//!
//! Also provides [`Transport`], the one concrete client stream type (plain
//! TCP or TLS) so the rest of the crate never spells out the generics.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Client-side byte stream: plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A duplex stream with a push-back head buffer.
///
/// Ownership is exclusive: the control loop owns the stream until a session
/// takes over, so writes are serialized by construction.
#[derive(Debug)]
pub struct BufferedStream<S> {
    stream: S,
    head: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BufferedStream<S> {
    /// Wrap `stream`, seeding the head buffer with `head` (bytes that were
    /// read past the upgrade handshake, for instance).
    pub fn new(stream: S, head: BytesMut) -> Self {
        Self { stream, head }
    }

    /// Read up to `max` bytes. The head buffer is consumed first; the
    /// underlying stream is only touched when the head is empty. Returns an
    /// empty chunk on EOF.
    pub async fn recv(&mut self, max: usize) -> io::Result<Bytes> {
        if !self.head.is_empty() {
            let n = self.head.len().min(max);
            return Ok(self.head.split_to(n).freeze());
        }
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Read from the underlying stream and return the buffered head with
    /// the new bytes appended. Unlike [`Self::recv`] this always waits for
    /// the socket, so a parse loop that pushed back a partial frame makes
    /// progress instead of re-reading its own leftovers. An empty chunk
    /// always means EOF; a buffered partial frame stays in the head (it can
    /// never complete).
    pub async fn fill(&mut self, max: usize) -> io::Result<Bytes> {
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        let mut out = self.head.split();
        out.extend_from_slice(&buf[..n]);
        Ok(out.freeze())
    }

    /// Whether the head buffer contains `needle`; used by message loops to
    /// process a buffered complete frame before blocking on the socket.
    pub fn head_contains(&self, needle: &[u8]) -> bool {
        !needle.is_empty() && self.head.windows(needle.len()).any(|w| w == needle)
    }

    /// Push `data` back so the next read sees it first.
    pub fn unrecv(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut head = BytesMut::with_capacity(data.len() + self.head.len());
        head.extend_from_slice(data);
        head.extend_from_slice(&self.head);
        self.head = head;
    }

    /// Drain and return the head buffer without reading the stream.
    pub fn take_head(&mut self) -> Bytes {
        self.head.split().freeze()
    }

    /// Whether any pushed-back bytes are waiting.
    pub fn has_head(&self) -> bool {
        !self.head.is_empty()
    }

    /// Write `data` in full and flush. One message, one call.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Shut down the write half of the underlying stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Split back into the raw stream and any remaining head bytes.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.head)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.head.is_empty() {
            let n = this.head.len().min(buf.remaining());
            buf.put_slice(&this.head.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped(
        data: &[u8],
    ) -> (
        BufferedStream<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let mut s = BufferedStream::new(a, BytesMut::new());
        s.unrecv(data);
        (s, b)
    }

    #[tokio::test]
    async fn recv_drains_head_before_stream() {
        let (mut s, _peer) = wrapped(b"hello");
        let chunk = s.recv(3).await.unwrap();
        assert_eq!(&chunk[..], b"hel");
        let chunk = s.recv(16).await.unwrap();
        assert_eq!(&chunk[..], b"lo");
        assert!(!s.has_head());
    }

    #[tokio::test]
    async fn unrecv_prepends() {
        let (mut s, _peer) = wrapped(b"world");
        s.unrecv(b"hello ");
        let chunk = s.recv(64).await.unwrap();
        assert_eq!(&chunk[..], b"hello world");
    }

    #[tokio::test]
    async fn recv_reads_stream_when_head_empty() {
        let (mut s, mut peer) = wrapped(b"");
        peer.write_all(b"abc").await.unwrap();
        let chunk = s.recv(64).await.unwrap();
        assert_eq!(&chunk[..], b"abc");
    }

    #[tokio::test]
    async fn recv_returns_empty_on_eof() {
        let (mut s, peer) = wrapped(b"");
        drop(peer);
        let chunk = s.recv(64).await.unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn take_head_empties_buffer() {
        let (mut s, _peer) = wrapped(b"leftover");
        assert_eq!(&s.take_head()[..], b"leftover");
        assert!(!s.has_head());
    }

    #[tokio::test]
    async fn async_read_consumes_head_first() {
        let (mut s, mut peer) = wrapped(b"head-");
        peer.write_all(b"tail").await.unwrap();
        drop(peer);
        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"head-tail");
    }

    #[tokio::test]
    async fn fill_appends_socket_bytes_to_head() {
        let (mut s, mut peer) = wrapped(b"partial-");
        peer.write_all(b"rest").await.unwrap();
        let chunk = s.fill(64).await.unwrap();
        assert_eq!(&chunk[..], b"partial-rest");
        assert!(!s.has_head());
    }

    #[tokio::test]
    async fn fill_reports_eof_even_with_buffered_head() {
        let (mut s, peer) = wrapped(b"tail");
        drop(peer);
        assert!(s.fill(64).await.unwrap().is_empty());
        // The undeliverable partial stays buffered for raw-mode readers.
        assert!(s.has_head());
    }

    #[test]
    fn head_contains_finds_needle() {
        let (a, _b) = tokio::io::duplex(64);
        let mut s = BufferedStream::new(a, BytesMut::new());
        s.unrecv(b"{\"a\":1}\r\nxx");
        assert!(s.head_contains(b"\r\n"));
        assert!(!s.head_contains(b"zz"));
        assert!(!s.head_contains(b""));
    }

    #[tokio::test]
    async fn send_writes_through() {
        let (mut s, mut peer) = wrapped(b"");
        s.send(b"ping\r\n").await.unwrap();
        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\r\n");
    }
}
