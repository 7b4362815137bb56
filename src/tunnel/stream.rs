//! Logical stream handles
//!
//! A `MuxStream` is an ordered reliable byte channel inside a mux session.
//! It splits into a reader and a writer half so a relay can pump both
//! directions concurrently. The writer consumes send-window credit before
//! every DATA frame; the reader returns credit to the remote sender as the
//! application drains received bytes.

use super::multiplexer::{Shared, StreamEvent};
use super::{Frame, TunnelError};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// A logical stream (both halves together)
pub struct MuxStream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl MuxStream {
    pub(super) fn new(
        id: u32,
        shared: Arc<Shared>,
        event_rx: mpsc::UnboundedReceiver<StreamEvent>,
        send_window: Arc<Semaphore>,
    ) -> Self {
        Self {
            reader: StreamReader {
                id,
                shared: shared.clone(),
                event_rx,
                pending: BytesMut::new(),
                consumed: 0,
                eof: false,
            },
            writer: StreamWriter {
                id,
                shared,
                send_window,
                closed: false,
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.reader.id
    }

    /// Split into independent read/write halves.
    pub fn into_split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }

    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        self.reader.read_chunk().await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TunnelError> {
        self.reader.read_exact(buf).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        self.writer.write_all(data).await
    }

    pub async fn close(&mut self) {
        self.writer.close().await;
    }
}

/// Read half of a logical stream
pub struct StreamReader {
    id: u32,
    shared: Arc<Shared>,
    event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    pending: BytesMut,
    consumed: usize,
    eof: bool,
}

impl StreamReader {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Receive the next chunk of bytes, or `None` at end-of-stream. A stream
    /// closed by the remote still delivers everything received before the
    /// close frame.
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        if !self.pending.is_empty() {
            return Some(self.pending.split().freeze());
        }
        self.next_event().await
    }

    /// Fill `buf` completely or fail with `StreamClosed`.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TunnelError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pending.is_empty() {
                match self.next_event().await {
                    Some(chunk) => self.pending.extend_from_slice(&chunk),
                    None => return Err(TunnelError::StreamClosed),
                }
            }
            let n = self.pending.len().min(buf.len() - filled);
            let chunk = self.pending.split_to(n);
            buf[filled..filled + n].copy_from_slice(&chunk);
            filled += n;
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Bytes> {
        if self.eof {
            return None;
        }
        match self.event_rx.recv().await {
            Some(StreamEvent::Data(bytes)) => {
                self.grant(bytes.len()).await;
                Some(bytes)
            }
            Some(StreamEvent::Closed) | None => {
                self.eof = true;
                None
            }
        }
    }

    /// Return receive credit to the remote sender once half the window has
    /// been drained.
    async fn grant(&mut self, n: usize) {
        self.consumed += n;
        let threshold = (self.shared.config.stream_window() / 2).max(1);
        if self.consumed >= threshold {
            let frame = Frame::window_grant(self.id, self.consumed as u32);
            self.consumed = 0;
            let _ = self.shared.frame_tx.send(frame).await;
        }
    }
}

/// Write half of a logical stream
pub struct StreamWriter {
    id: u32,
    shared: Arc<Shared>,
    send_window: Arc<Semaphore>,
    closed: bool,
}

impl StreamWriter {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Write all of `data`, chunked to the configured frame size. Blocks on
    /// send-window credit, which is the natural backpressure path.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        if self.closed {
            return Err(TunnelError::StreamClosed);
        }
        let frame_size = self.shared.config.frame_size.max(1);
        for chunk in data.chunks(frame_size) {
            let permit = self
                .send_window
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| TunnelError::StreamClosed)?;
            permit.forget();

            self.shared
                .frame_tx
                .send(Frame::data(self.id, Bytes::copy_from_slice(chunk)))
                .await
                .map_err(|_| TunnelError::SessionClosed)?;
        }
        Ok(())
    }

    /// Send a close frame; the remote may still deliver buffered bytes to
    /// its reader before surfacing end-of-stream.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.active.fetch_sub(1, Ordering::Relaxed);
            let _ = self.shared.frame_tx.send(Frame::close(self.id)).await;
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.active.fetch_sub(1, Ordering::Relaxed);
            let _ = self.shared.frame_tx.try_send(Frame::close(self.id));
        }
    }
}
