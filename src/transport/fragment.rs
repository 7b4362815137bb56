//! Record-fragment dialer
//!
//! A middlebox classifying the first bytes of a fresh TCP connection may
//! recognize a TLS ClientHello or an HTTP request and block the flow. This
//! wrapper slices the first burst of client writes into randomly sized
//! pieces with a jittered sleep between sends, then becomes transparent.
//! Bytes are never reordered; sleeps are best-effort.

use crate::crypto::random_range;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// How many leading bytes get sliced: enough to cover a mimicked
/// ClientHello or the HTTP upgrade request.
const FRAGMENT_BUDGET: usize = 1024;

/// TCP fragmentation knobs
#[derive(Debug, Clone)]
pub struct FragmentParams {
    pub enabled: bool,
    /// Fragment size range in bytes
    pub min_size: usize,
    pub max_size: usize,
    /// Inter-fragment sleep range in milliseconds
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for FragmentParams {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 64,
            max_size: 191,
            min_delay_ms: 1,
            max_delay_ms: 10,
        }
    }
}

/// Stream wrapper that fragments the first [`FRAGMENT_BUDGET`] bytes written.
pub struct FragmentedStream<S> {
    inner: S,
    params: FragmentParams,
    remaining: usize,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<S> FragmentedStream<S> {
    pub fn new(inner: S, params: FragmentParams) -> Self {
        let remaining = if params.enabled { FRAGMENT_BUDGET } else { 0 };
        Self {
            inner,
            params,
            remaining,
            delay: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.remaining == 0 || buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        if let Some(delay) = this.delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.delay = None,
            }
        }

        let piece = random_range(this.params.min_size as u64, this.params.max_size as u64)
            as usize;
        let piece = piece.clamp(1, buf.len()).min(this.remaining);

        let written = match Pin::new(&mut this.inner).poll_write(cx, &buf[..piece]) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(n)) => n,
        };

        this.remaining = this.remaining.saturating_sub(written);
        if this.remaining > 0 {
            let ms = random_range(this.params.min_delay_ms, this.params.max_delay_ms);
            this.delay = Some(Box::pin(tokio::time::sleep(Duration::from_millis(ms))));
        }

        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Sink that records each individual write call.
    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<Vec<u8>>,
    }

    impl AsyncWrite for RecordingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.get_mut().chunks.push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn params(min: usize, max: usize) -> FragmentParams {
        FragmentParams {
            enabled: true,
            min_size: min,
            max_size: max,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_burst_is_sliced_and_preserved() {
        let data: Vec<u8> = (0..600u32).map(|i| (i % 256) as u8).collect();
        let mut stream = FragmentedStream::new(RecordingSink::default(), params(64, 191));

        stream.write_all(&data).await.unwrap();

        let sink = &stream.inner;
        assert!(sink.chunks.len() > 1, "first write must be fragmented");
        for chunk in &sink.chunks {
            assert!(chunk.len() <= 191);
        }
        let total: usize = sink.chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, data.len());
        let reassembled: Vec<u8> = sink.chunks.iter().flatten().copied().collect();
        assert_eq!(reassembled, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transparent_after_budget() {
        let mut stream = FragmentedStream::new(RecordingSink::default(), params(64, 191));

        stream.write_all(&vec![0xaa; FRAGMENT_BUDGET]).await.unwrap();
        let sliced_writes = stream.inner.chunks.len();
        assert!(sliced_writes > 1);

        // past the budget: a large write passes through whole
        stream.write_all(&vec![0xbb; 4096]).await.unwrap();
        assert_eq!(stream.inner.chunks.len(), sliced_writes + 1);
        assert_eq!(stream.inner.chunks.last().unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_disabled_is_passthrough() {
        let mut p = params(1, 2);
        p.enabled = false;
        let mut stream = FragmentedStream::new(RecordingSink::default(), p);

        stream.write_all(&[1u8; 300]).await.unwrap();
        assert_eq!(stream.inner.chunks.len(), 1);
        assert_eq!(stream.inner.chunks[0].len(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_writes_not_padded_together() {
        // fragmentation must never reorder or merge bytes
        let mut stream = FragmentedStream::new(RecordingSink::default(), params(4, 8));
        stream.write_all(b"abcdefghij").await.unwrap();
        stream.write_all(b"klmnop").await.unwrap();

        let reassembled: Vec<u8> = stream.inner.chunks.iter().flatten().copied().collect();
        assert_eq!(reassembled, b"abcdefghijklmnop");
    }
}
