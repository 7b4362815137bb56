//! Multiplexer session
//!
//! One `MuxSession` is bound to one disguised transport. Three tasks run per
//! session: a reader draining AEAD records into frames, a writer batching
//! outbound frames into records, and a keepalive loop that declares the
//! session dead after `interval x 10` of silence. Once the session is
//! destroyed, every child stream fails all subsequent reads and writes.

use super::stream::MuxStream;
use super::{Frame, FrameType, MuxConfig, TunnelError};
use crate::crypto::EnvelopeKey;
use crate::mimic::UpgradedStream;
use crate::obfs::ObfsParams;
use crate::transport::record::{RecordReader, RecordWriter};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, trace, warn};

/// Outbound frames are coalesced into records up to this many bytes
const BATCH_LIMIT: usize = 8 * 1024;

/// Which side of the tunnel this session is. The client opens streams with
/// odd ids starting at 1, the server with even ids starting at 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Event delivered to a stream's reader half
#[derive(Debug)]
pub(super) enum StreamEvent {
    Data(Bytes),
    Closed,
}

pub(super) struct StreamSlot {
    pub(super) event_tx: mpsc::UnboundedSender<StreamEvent>,
    pub(super) send_window: Arc<Semaphore>,
}

/// State shared between the session handle, its tasks and its streams
pub(super) struct Shared {
    pub(super) config: MuxConfig,
    pub(super) frame_tx: mpsc::Sender<Frame>,
    pub(super) streams: Mutex<HashMap<u32, StreamSlot>>,
    pub(super) active: AtomicUsize,
    next_id: AtomicU32,
    closed: AtomicBool,
    shutdown: Notify,
    last_recv: Mutex<Instant>,
}

/// A stream multiplexer session over one disguised transport
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Wire a session on top of an upgraded byte pipe and spawn its tasks.
    pub fn start(
        io: UpgradedStream,
        key: Option<EnvelopeKey>,
        obfs: ObfsParams,
        config: MuxConfig,
        role: Role,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = RecordReader::new(read_half, key.clone(), obfs.clone());
        let writer = RecordWriter::new(write_half, key, obfs);

        let (frame_tx, frame_rx) = mpsc::channel(1024);
        let (accept_tx, accept_rx) = mpsc::channel(64);

        let shared = Arc::new(Shared {
            config,
            frame_tx,
            streams: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            next_id: AtomicU32::new(role.first_id()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            last_recv: Mutex::new(Instant::now()),
        });

        tokio::spawn(read_loop(shared.clone(), reader, accept_tx));
        tokio::spawn(write_loop(shared.clone(), writer, frame_rx));
        tokio::spawn(keepalive_loop(shared.clone()));

        Arc::new(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    /// Open a new logical stream towards the peer.
    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = register_stream(&self.shared, id);
        self.shared
            .frame_tx
            .send(Frame::open(id))
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        trace!("opened stream {}", id);
        Ok(stream)
    }

    /// Wait for the peer to open a stream. Returns `None` once the session
    /// is destroyed and the backlog is drained.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of streams that have been opened and not yet closed
    pub fn active_streams(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Tear the session down; all child streams fail from here on.
    pub fn close(&self) {
        close_session(&self.shared);
    }

    /// Resolve once the session has been destroyed.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.shared.shutdown.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

fn register_stream(shared: &Arc<Shared>, id: u32) -> MuxStream {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let send_window = Arc::new(Semaphore::new(shared.config.stream_window()));
    shared.streams.lock().unwrap().insert(
        id,
        StreamSlot {
            event_tx,
            send_window: send_window.clone(),
        },
    );
    shared.active.fetch_add(1, Ordering::Relaxed);
    MuxStream::new(id, shared.clone(), event_rx, send_window)
}

fn close_session(shared: &Arc<Shared>) {
    if shared.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut streams = shared.streams.lock().unwrap();
    for (_, slot) in streams.drain() {
        let _ = slot.event_tx.send(StreamEvent::Closed);
        slot.send_window.close();
    }
    drop(streams);
    shared.shutdown.notify_waiters();
    debug!("mux session destroyed");
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: RecordReader<ReadHalf<UpgradedStream>>,
    accept_tx: mpsc::Sender<MuxStream>,
) {
    let mut acc = BytesMut::new();
    'session: loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        let shutdown = shared.shutdown.notified();
        tokio::select! {
            _ = shutdown => break,
            record = reader.read_record() => match record {
                Ok(plain) => {
                    *shared.last_recv.lock().unwrap() = Instant::now();
                    acc.extend_from_slice(&plain);
                    loop {
                        match Frame::decode(&mut acc) {
                            Ok(Some(frame)) => {
                                if handle_frame(&shared, &accept_tx, frame).await.is_err() {
                                    break 'session;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!("fatal frame error: {}", e);
                                break 'session;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("transport read ended: {}", e);
                    break;
                }
            }
        }
    }
    close_session(&shared);
}

async fn handle_frame(
    shared: &Arc<Shared>,
    accept_tx: &mpsc::Sender<MuxStream>,
    frame: Frame,
) -> Result<(), TunnelError> {
    match frame.frame_type {
        FrameType::Ping => {
            // best-effort: the reader must never block on the writer queue,
            // and any received bytes already refresh the liveness clock
            let _ = shared.frame_tx.try_send(Frame::pong(frame.payload));
        }
        FrameType::Pong => {}
        FrameType::Open => {
            let id = frame.stream_id;
            if id == 0 || shared.streams.lock().unwrap().contains_key(&id) {
                return Err(TunnelError::InvalidFrame(format!(
                    "open for stream {} already known",
                    id
                )));
            }
            trace!("peer opened stream {}", id);
            let stream = register_stream(shared, id);
            // Dropping the stream on a full/abandoned accept queue sends
            // CLOSE back to the peer.
            let _ = accept_tx.send(stream).await;
        }
        FrameType::Close => {
            if let Some(slot) = shared.streams.lock().unwrap().remove(&frame.stream_id) {
                let _ = slot.event_tx.send(StreamEvent::Closed);
            }
        }
        FrameType::Data if frame.stream_id == 0 => {
            let (sid, credit) = Frame::parse_window_grant(&frame.payload)?;
            if let Some(slot) = shared.streams.lock().unwrap().get(&sid) {
                slot.send_window.add_permits(credit as usize);
            }
        }
        FrameType::Data => {
            let sid = frame.stream_id;
            let delivered = {
                let streams = shared.streams.lock().unwrap();
                match streams.get(&sid) {
                    Some(slot) => slot.event_tx.send(StreamEvent::Data(frame.payload)).is_ok(),
                    None => {
                        trace!("data for unknown stream {}", sid);
                        true
                    }
                }
            };
            if !delivered {
                // Local reader is gone; tell the peer to stop sending.
                shared.streams.lock().unwrap().remove(&sid);
                let _ = shared.frame_tx.try_send(Frame::close(sid));
            }
        }
    }
    Ok(())
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: RecordWriter<WriteHalf<UpgradedStream>>,
    mut frame_rx: mpsc::Receiver<Frame>,
) {
    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        let shutdown = shared.shutdown.notified();
        let frame = tokio::select! {
            _ = shutdown => break,
            f = frame_rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };

        let mut buf = frame.encode();
        while buf.len() < BATCH_LIMIT {
            match frame_rx.try_recv() {
                Ok(f) => buf.extend_from_slice(&f.encode()),
                Err(_) => break,
            }
        }

        if let Err(e) = writer.write_record(&buf).await {
            debug!("transport write ended: {}", e);
            break;
        }
    }
    close_session(&shared);
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let timeout = shared.config.keepalive_timeout();
    let mut tick = tokio::time::interval(shared.config.keepalive);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        let shutdown = shared.shutdown.notified();
        tokio::select! {
            _ = shutdown => break,
            _ = tick.tick() => {
                let idle = shared.last_recv.lock().unwrap().elapsed();
                if idle > timeout {
                    warn!("keepalive timeout after {:.1?}, destroying session", idle);
                    break;
                }
                let _ = shared.frame_tx.try_send(Frame::ping());
            }
        }
    }
    close_session(&shared);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> MuxConfig {
        MuxConfig {
            keepalive: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn session_pair(psk: &str) -> (Arc<MuxSession>, Arc<MuxSession>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let key = EnvelopeKey::derive(psk);
        let up_a = UpgradedStream::new(Box::new(a), BytesMut::new());
        let up_b = UpgradedStream::new(Box::new(b), BytesMut::new());
        let client = MuxSession::start(
            up_a,
            key.clone(),
            ObfsParams::default(),
            test_config(),
            Role::Client,
        );
        let server = MuxSession::start(up_b, key, ObfsParams::default(), test_config(), Role::Server);
        (client, server)
    }

    #[tokio::test]
    async fn test_stream_id_parity() {
        let (client, server) = session_pair("psk");
        let c1 = client.open_stream().await.unwrap();
        let c2 = client.open_stream().await.unwrap();
        assert_eq!(c1.id(), 1);
        assert_eq!(c2.id(), 3);

        let s1 = server.open_stream().await.unwrap();
        assert_eq!(s1.id(), 2);
    }

    #[tokio::test]
    async fn test_open_accept_and_transfer() {
        let (client, server) = session_pair("psk");

        let mut outbound = server.open_stream().await.unwrap();
        outbound.write_all(b"hello from server").await.unwrap();

        let mut inbound = client.accept_stream().await.unwrap();
        assert_eq!(inbound.id(), 2);

        let mut buf = [0u8; 17];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from server");

        // reply direction
        inbound.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        outbound.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn test_ordered_delivery_across_frames() {
        let (client, server) = session_pair("psk");

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut tx = server.open_stream().await.unwrap();
        tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            tx.close().await;
        });

        let mut rx = client.accept_stream().await.unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = rx.read_chunk().await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_close_delivers_pending_then_eof() {
        let (client, server) = session_pair("psk");

        let mut tx = server.open_stream().await.unwrap();
        tx.write_all(b"last words").await.unwrap();
        tx.close().await;

        let mut rx = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 10];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last words");
        assert!(rx.read_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_session_close_fails_streams() {
        let (client, server) = session_pair("psk");

        let mut stream = server.open_stream().await.unwrap();
        let _ = client.accept_stream().await.unwrap();

        server.close();
        server.wait_closed().await;

        assert!(server.is_closed());
        assert!(stream.write_all(b"too late").await.is_err());
        assert!(server.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn test_peer_drop_destroys_session() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let key = EnvelopeKey::derive("psk");
        let up = UpgradedStream::new(Box::new(a), BytesMut::new());
        let session = MuxSession::start(
            up,
            key,
            ObfsParams::default(),
            test_config(),
            Role::Client,
        );
        drop(b);
        tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
            .await
            .expect("session should notice transport EOF");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_active_stream_count() {
        let (client, server) = session_pair("psk");
        assert_eq!(server.active_streams(), 0);

        let mut s = server.open_stream().await.unwrap();
        assert_eq!(server.active_streams(), 1);
        let _ = client.accept_stream().await.unwrap();

        s.close().await;
        assert_eq!(server.active_streams(), 0);
    }
}
