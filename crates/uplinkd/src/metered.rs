//! Transport wrapper counting the bytes actually crossing the socket.
//!
//! Wraps the accepted TCP stream before hyper serves it, so the HTTP
//! upgrade's own bytes are counted and everything after compression is
//! included. The shared [`WireMeter`] travels to the WebSocket handler
//! through request extensions.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use uplink_store::WireMeter;

pub struct MeteredStream<S> {
    inner: S,
    meter: Arc<WireMeter>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, meter: Arc<WireMeter>) -> Self {
        Self { inner, meter }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.meter.add_read(n as u64);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                this.meter.add_written(n as u64);
            }
        }
        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                this.meter.add_written(n as u64);
            }
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_bytes_in_both_directions() {
        let (near, mut far) = tokio::io::duplex(64);
        let meter = Arc::new(WireMeter::default());
        let mut metered = MeteredStream::new(near, meter.clone());

        metered.write_all(b"hello").await.unwrap();
        metered.flush().await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        far.write_all(b"worlds!").await.unwrap();
        let mut buf = [0u8; 7];
        metered.read_exact(&mut buf).await.unwrap();

        assert_eq!(meter.bytes_written(), 5);
        assert_eq!(meter.bytes_read(), 7);
    }
}
