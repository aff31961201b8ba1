//! Bidirectional relay with half-close
//!
//! Each direction reads until EOF or an error, then flushes and shuts down
//! the opposite write side exactly once. The relay completes only when both directions
//! have finished, so one peer closing its write side never cuts off data
//! still flowing the other way.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Per-direction buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes from the accepted connection to the tunnel
    pub src_to_dst: u64,
    /// Bytes from the tunnel back to the accepted connection
    pub dst_to_src: u64,
}

impl CopyResult {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.src_to_dst + self.dst_to_src
    }
}

struct Relay<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: Direction,
    b_to_a: Direction,
}

struct Direction {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    read_done: bool,
    flushed: bool,
    shut_down: bool,
    failed: bool,
    transferred: u64,
}

impl Direction {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            pos: 0,
            cap: 0,
            read_done: false,
            flushed: false,
            shut_down: false,
            failed: false,
            transferred: 0,
        }
    }

    const fn is_done(&self) -> bool {
        self.shut_down || self.failed
    }

    /// Drive one direction: copy until EOF or error, then close the writer
    ///
    /// A copy error ends the direction like an EOF would, so the peer still
    /// sees its write side shut down.
    fn poll_direction<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        label: &str,
        reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.is_done() {
            return;
        }

        if !self.read_done {
            match self.poll_copy(cx, reader, writer.as_mut()) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => {
                    debug!("{} relay error: {}", label, e);
                    self.read_done = true;
                    self.pos = 0;
                    self.cap = 0;
                }
                Poll::Pending => return,
            }
        }

        match self.poll_close(cx, label, writer) {
            Poll::Ready(Ok(())) => self.shut_down = true,
            Poll::Ready(Err(e)) => {
                debug!("{} shutdown error: {}", label, e);
                self.failed = true;
            }
            Poll::Pending => {}
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }

    /// Flush, then shut down the write side once
    fn poll_close<W>(
        &mut self,
        cx: &mut Context<'_>,
        label: &str,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if !self.flushed {
            match writer.as_mut().poll_flush(cx) {
                Poll::Ready(res) => {
                    self.flushed = true;
                    if let Err(e) = res {
                        debug!("{} flush error: {}", label, e);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        writer.poll_shutdown(cx)
    }
}

impl<A, B> std::future::Future for Relay<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = CopyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        this.a_to_b
            .poll_direction(cx, "src->dst", Pin::new(&mut *this.a), Pin::new(&mut *this.b));
        this.b_to_a
            .poll_direction(cx, "dst->src", Pin::new(&mut *this.b), Pin::new(&mut *this.a));

        if this.a_to_b.is_done() && this.b_to_a.is_done() {
            Poll::Ready(CopyResult {
                src_to_dst: this.a_to_b.transferred,
                dst_to_src: this.b_to_a.transferred,
            })
        } else {
            Poll::Pending
        }
    }
}

/// Relay bytes between `src` and `dst` until both directions end
///
/// A failing direction is logged and still shuts down its peer's write side;
/// the other keeps going until its own EOF. Callers drop both streams
/// afterwards.
pub async fn relay<A, B>(src: &mut A, dst: &mut B) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    relay_with_buffer(src, dst, DEFAULT_BUFFER_SIZE).await
}

/// Same as [`relay`] with a custom per-direction buffer size
pub async fn relay_with_buffer<A, B>(src: &mut A, dst: &mut B, buf_size: usize) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Relay {
        a: src,
        b: dst,
        a_to_b: Direction::new(buf_size),
        b_to_a: Direction::new(buf_size),
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Counts shutdown calls that reached the inner stream
    struct CountingStream {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            let res = Pin::new(&mut self.inner).poll_shutdown(cx);
            if res.is_ready() {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            res
        }
    }

    fn counting(inner: DuplexStream) -> (CountingStream, Arc<AtomicUsize>) {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        (
            CountingStream {
                inner,
                shutdowns: shutdowns.clone(),
            },
            shutdowns,
        )
    }

    // ========================================================================
    // Half-close
    // ========================================================================

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let (mut client, proxy_src) = duplex(1024);
        let (proxy_dst, mut server) = duplex(1024);
        let (mut proxy_src, src_shutdowns) = counting(proxy_src);
        let (mut proxy_dst, dst_shutdowns) = counting(proxy_dst);

        let relay_task = tokio::spawn(async move {
            let result = relay(&mut proxy_src, &mut proxy_dst).await;
            (result, proxy_src, proxy_dst)
        });

        // Client sends a request and closes its write side
        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");
        assert_eq!(dst_shutdowns.load(Ordering::SeqCst), 1);

        // The reverse direction still works after the first half-close
        assert!(!relay_task.is_finished());
        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let (result, _src, _dst) = relay_task.await.unwrap();
        assert_eq!(result.src_to_dst, 7);
        assert_eq!(result.dst_to_src, 8);
        assert_eq!(result.total(), 15);
        assert_eq!(src_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(dst_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_relay_ends_when_one_side_fails() {
        let (mut client, mut proxy_src) = duplex(64);
        let (mut proxy_dst, server) = duplex(64);

        // Server vanishes; writes towards it fail with a broken pipe
        drop(server);
        client.write_all(b"lost").await.unwrap();
        client.shutdown().await.unwrap();

        let result = relay(&mut proxy_src, &mut proxy_dst).await;
        assert_eq!(result.dst_to_src, 0);
    }

    /// Yields `data` once, then fails every read with a connection reset
    struct ResetAfter {
        data: Option<&'static [u8]>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::ErrorKind::ConnectionReset.into())),
            }
        }
    }

    impl AsyncWrite for ResetAfter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_error_still_half_closes_peer() {
        let src_shutdowns = Arc::new(AtomicUsize::new(0));
        let mut src = ResetAfter {
            data: Some(b"partial"),
            shutdowns: src_shutdowns.clone(),
        };
        let (proxy_dst, mut server) = duplex(1024);
        let (mut proxy_dst, dst_shutdowns) = counting(proxy_dst);

        let relay_task = tokio::spawn(async move { relay(&mut src, &mut proxy_dst).await });

        // The server sees the partial data followed by EOF
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), server.read_to_end(&mut received))
            .await
            .expect("server never saw EOF")
            .unwrap();
        assert_eq!(received, b"partial");
        assert_eq!(dst_shutdowns.load(Ordering::SeqCst), 1);

        // Server closes its side; the relay completes
        server.shutdown().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("relay never finished")
            .unwrap();
        assert_eq!(result.src_to_dst, 7);
        assert_eq!(src_shutdowns.load(Ordering::SeqCst), 1);
    }

    // ========================================================================
    // CopyResult
    // ========================================================================

    #[test]
    fn test_copy_result_total() {
        let result = CopyResult {
            src_to_dst: 100,
            dst_to_src: 200,
        };
        assert_eq!(result.total(), 300);
    }
}
