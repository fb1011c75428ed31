use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Wraps a stream with a prefix buffer so bytes consumed during protocol
/// sniffing or proxy handshakes are replayed to later readers. Writes pass
/// straight through.
#[derive(Debug)]
pub struct PeekableStream<S> {
    inner: S,
    buffer: Vec<u8>,
    pos: usize,
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_prefix(inner, Vec::new())
    }

    pub fn with_prefix(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            buffer: prefix,
            pos: 0,
        }
    }

    /// Puts already-read bytes back in front of the stream.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut replacement = Vec::with_capacity(bytes.len() + self.buffered().len());
        replacement.extend_from_slice(bytes);
        replacement.extend_from_slice(self.buffered());
        self.buffer = replacement;
        self.pos = 0;
    }

    fn buffered(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Returns up to `n` bytes without consuming them. Short output means
    /// the stream hit EOF first; I/O failures surface as errors.
    pub async fn peek(&mut self, n: usize) -> std::io::Result<&[u8]> {
        while self.buffered().len() < n {
            let mut chunk = [0_u8; 4096];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            // compact the consumed prefix before growing
            if self.pos > 0 {
                self.buffer.drain(..self.pos);
                self.pos = 0;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        let available = self.buffered().len().min(n);
        Ok(&self.buffered()[..available])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buffer.len() {
            let available = &this.buffer[this.pos..];
            let take = available.len().min(buf.remaining());
            buf.put_slice(&available[..take]);
            this.pos += take;
            if this.pos == this.buffer.len() {
                this.buffer.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
