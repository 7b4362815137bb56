//! Path connector workers
//!
//! The client runs one worker per connection-pool slot per configured path.
//! Each worker keeps exactly one disguised transport alive: it dials,
//! upgrades, wraps and registers a mux session, then serves reverse streams
//! until the session dies and loops.
//!
//! Failure accounting distinguishes "path was never usable" from "path
//! worked for a while, something downstream died": only connections that end
//! within 30 seconds count toward rotation.

use crate::config::Config;
use crate::pool::SessionPool;
use crate::relay;
use crate::transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connections shorter than this count as path failures
const SHORT_FAILURE: Duration = Duration::from_secs(30);

/// Consecutive short failures before rotating to the next path
const FAIL_THRESHOLD: u32 = 3;

/// Cool-down after a full rotation cycle
const CYCLE_COOLDOWN: Duration = Duration::from_secs(10);

/// Stagger between workers of one path, to avoid a synchronized burst of
/// identical-looking handshakes
const WORKER_STAGGER: Duration = Duration::from_millis(500);

/// Aggressive paths retry at most this fast
const AGGRESSIVE_RETRY_CAP: Duration = Duration::from_millis(500);

/// Run one worker slot forever.
pub async fn run_path_worker(
    cfg: Arc<Config>,
    pool: Arc<SessionPool>,
    start_index: usize,
    slot: usize,
) {
    tokio::time::sleep(WORKER_STAGGER * slot as u32).await;

    let paths = &cfg.paths;
    let mut path_index = start_index;
    let mut fail_count = 0u32;

    loop {
        let path = &paths[path_index];
        let started = Instant::now();
        let result = connect_and_serve(path_index, &cfg, &pool).await;
        let elapsed = started.elapsed();

        match result {
            Err(e) if elapsed < SHORT_FAILURE => {
                fail_count += 1;
                debug!(
                    "path[{}] failed after {:.1?} ({} consecutive): {}",
                    path_index, elapsed, fail_count, e
                );
            }
            Err(e) => {
                debug!("path[{}] ended after {:.1?}: {}", path_index, elapsed, e);
                fail_count = 0;
            }
            Ok(()) => {
                fail_count = 0;
            }
        }

        if fail_count >= FAIL_THRESHOLD && paths.len() > 1 {
            let wrapped = path_index == paths.len() - 1;
            path_index = (path_index + 1) % paths.len();
            fail_count = 0;
            info!("switching to path[{}]", path_index);
            if wrapped {
                warn!("all paths tried, cooling down {:?}", CYCLE_COOLDOWN);
                tokio::time::sleep(CYCLE_COOLDOWN).await;
            }
        }

        let mut retry = paths[path_index].retry_interval;
        if paths[path_index].aggressive {
            retry = retry.min(AGGRESSIVE_RETRY_CAP);
        }
        tokio::time::sleep(retry).await;
    }
}

/// Establish one disguised transport on the given path and serve reverse
/// streams until the session ends.
pub async fn connect_and_serve(
    path_index: usize,
    cfg: &Config,
    pool: &Arc<SessionPool>,
) -> crate::Result<()> {
    let path = &cfg.paths[path_index];
    let session = transport::establish(path, cfg).await?;
    info!("path[{}] connected to {}", path_index, path.addr);

    pool.add(session.clone()).await;

    while let Some(stream) = session.accept_stream().await {
        tokio::spawn(relay::handle_peer_stream(stream));
    }

    pool.remove(&session).await;
    session.close();
    debug!("path[{}] session ended", path_index);
    Err(crate::Error::Transport(
        crate::transport::TransportError::Closed,
    ))
}
