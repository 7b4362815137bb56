//! Session pool
//!
//! Registry of live multiplexer sessions with round-robin stream dispatch.
//! Path workers add sessions on handshake success and remove them on session
//! end; a periodic sweeper compacts out closed sessions; the dispatcher
//! evicts zombies (sessions that fail `open_stream` despite not reporting
//! closed) on the spot.

use crate::tunnel::{MuxSession, MuxStream, TunnelError};
use crate::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Load shedding: sessions carrying more streams than this are skipped
const MAX_STREAMS_PER_SESSION: usize = 200;

/// Sweep interval for compacting closed sessions
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Longest target descriptor accepted on a new stream
pub const MAX_TARGET_LEN: usize = 4096;

/// Ordered collection of live mux sessions plus a round-robin cursor
pub struct SessionPool {
    sessions: RwLock<Vec<Arc<MuxSession>>>,
    cursor: AtomicUsize,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Register a freshly established session.
    pub async fn add(&self, session: Arc<MuxSession>) {
        if session.is_closed() {
            warn!("refusing to pool a session that is already closed");
            return;
        }
        let mut sessions = self.sessions.write().await;
        sessions.push(session);
        debug!("session added, pool size {}", sessions.len());
    }

    /// Remove a specific session (identity comparison).
    pub async fn remove(&self, session: &Arc<MuxSession>) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|s| !Arc::ptr_eq(s, session));
    }

    /// Number of pooled sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Open a logical stream on some live session and send the target
    /// descriptor header. The pick phase works on a lock-free snapshot so a
    /// blocking `open_stream` never holds the pool lock.
    pub async fn open_stream(&self, target: &str) -> crate::Result<MuxStream> {
        if target.is_empty() || target.len() > MAX_TARGET_LEN {
            return Err(Error::Tunnel(TunnelError::InvalidTarget(format!(
                "descriptor length {}",
                target.len()
            ))));
        }

        let snapshot: Vec<Arc<MuxSession>> = self.sessions.read().await.clone();
        if snapshot.is_empty() {
            return Err(Error::NoSession);
        }

        for _ in 0..snapshot.len() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
            let session = &snapshot[idx];

            if session.is_closed() {
                continue;
            }
            if session.active_streams() > MAX_STREAMS_PER_SESSION {
                debug!("session over stream budget, skipping");
                continue;
            }

            let mut stream = match session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    // zombie: claims to be live but cannot open streams
                    warn!("evicting zombie session: {}", e);
                    session.close();
                    self.remove(session).await;
                    continue;
                }
            };

            let mut header = Vec::with_capacity(2 + target.len());
            header.extend_from_slice(&(target.len() as u16).to_be_bytes());
            header.extend_from_slice(target.as_bytes());
            if let Err(e) = stream.write_all(&header).await {
                warn!("evicting session that lost its transport: {}", e);
                session.close();
                self.remove(session).await;
                continue;
            }

            return Ok(stream);
        }

        Err(Error::NoSession)
    }

    /// Compact out closed sessions. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|s| !s.is_closed());
        before - sessions.len()
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic health sweeper for a pool.
pub fn spawn_sweeper(pool: Arc<SessionPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let removed = pool.sweep().await;
            if removed > 0 {
                info!("health sweep removed {} dead session(s)", removed);
            }
        }
    })
}
