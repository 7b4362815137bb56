//! Reverse dispatcher — the server's application listeners
//!
//! Each configured map binds a local TCP or UDP socket. A new local peer
//! triggers a reverse stream: the dispatcher picks a live session from the
//! pool, the target descriptor tells the remote peer what to dial, and bytes
//! relay until either end closes. The application only ever sees normal byte
//! flow or a plain close; tunnel errors never surface.

use crate::pool::SessionPool;
use crate::relay;
use crate::tunnel::{StreamReader, StreamWriter};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Second attempt delay when no session is available for a TCP accept
const TCP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// UDP flow expiry
const UDP_FLOW_IDLE: Duration = Duration::from_secs(120);

/// UDP flow expiry scan interval
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Serve one `bind -> target` TCP map forever.
pub async fn serve_tcp_map(
    bind: String,
    target: String,
    pool: Arc<SessionPool>,
) -> crate::Result<()> {
    let listener = TcpListener::bind(&bind).await?;
    info!("tcp map {} -> {}", bind, target);
    serve_tcp_listener(listener, target, pool).await
}

/// Serve an already-bound TCP listener.
pub async fn serve_tcp_listener(
    listener: TcpListener,
    target: String,
    pool: Arc<SessionPool>,
) -> crate::Result<()> {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        debug!("local tcp peer {} for {}", peer, target);

        let pool = pool.clone();
        let target = target.clone();
        tokio::spawn(async move {
            dispatch_tcp(conn, &target, &pool).await;
        });
    }
}

async fn dispatch_tcp(conn: tokio::net::TcpStream, target: &str, pool: &SessionPool) {
    let _ = conn.set_nodelay(true);
    let descriptor = format!("tcp://{}", target);

    let stream = match pool.open_stream(&descriptor).await {
        Ok(stream) => stream,
        Err(_) => {
            tokio::time::sleep(TCP_RETRY_DELAY).await;
            match pool.open_stream(&descriptor).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("dropping local peer, {}", e);
                    return;
                }
            }
        }
    };

    let (reader, writer) = stream.into_split();
    relay::pipe_tcp(conn, reader, writer).await;
}

/// One tracked UDP source
struct UdpFlow {
    tx: mpsc::Sender<Bytes>,
    last_seen: Arc<AtomicU64>,
}

/// Serve one `bind -> target` UDP map forever. Each source address gets its
/// own logical stream; entries expire after 120 s idle.
pub async fn serve_udp_map(
    bind: String,
    target: String,
    pool: Arc<SessionPool>,
) -> crate::Result<()> {
    let socket = UdpSocket::bind(&bind).await?;
    info!("udp map {} -> {}", bind, target);
    serve_udp_socket(socket, target, pool).await
}

/// Serve an already-bound UDP socket.
pub async fn serve_udp_socket(
    socket: UdpSocket,
    target: String,
    pool: Arc<SessionPool>,
) -> crate::Result<()> {
    let socket = Arc::new(socket);

    let flows: Arc<Mutex<HashMap<SocketAddr, UdpFlow>>> = Arc::new(Mutex::new(HashMap::new()));
    let started = Instant::now();
    let now_secs = move || started.elapsed().as_secs();

    // expiry sweep
    {
        let flows = flows.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(UDP_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let cutoff = started.elapsed().saturating_sub(UDP_FLOW_IDLE).as_secs();
                let mut flows = flows.lock().unwrap();
                let before = flows.len();
                flows.retain(|_, flow| flow.last_seen.load(Ordering::Relaxed) >= cutoff);
                let expired = before - flows.len();
                if expired > 0 {
                    debug!("expired {} idle udp flow(s)", expired);
                }
            }
        });
    }

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("udp recv failed: {}", e);
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..n]);

        let existing = {
            let flows = flows.lock().unwrap();
            flows.get(&src).map(|flow| {
                flow.last_seen.store(now_secs(), Ordering::Relaxed);
                flow.tx.clone()
            })
        };

        if let Some(tx) = existing {
            if tx.try_send(packet).is_err() {
                // stream died between sweeps; forget the flow, the next
                // packet from this source reopens it
                flows.lock().unwrap().remove(&src);
            }
            continue;
        }

        // first packet from this source: open a reverse stream
        let descriptor = format!("udp://{}", target);
        let stream = match pool.open_stream(&descriptor).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("dropping first udp packet from {}: {}", src, e);
                continue;
            }
        };

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let last_seen = Arc::new(AtomicU64::new(now_secs()));
        flows.lock().unwrap().insert(
            src,
            UdpFlow {
                tx: tx.clone(),
                last_seen: last_seen.clone(),
            },
        );

        let (reader, writer) = stream.into_split();
        tokio::spawn(run_udp_flow(
            reader,
            writer,
            rx,
            socket.clone(),
            src,
            last_seen,
            started,
        ));

        let _ = tx.try_send(packet);
        debug!("opened udp flow for {}", src);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_udp_flow(
    mut reader: StreamReader,
    mut writer: StreamWriter,
    mut rx: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    last_seen: Arc<AtomicU64>,
    started: Instant,
) {
    let outbound = async move {
        while let Some(packet) = rx.recv().await {
            if relay::write_datagram(&mut writer, &packet).await.is_err() {
                break;
            }
        }
        writer.close().await;
    };

    let inbound = async move {
        while let Some(datagram) = relay::read_datagram(&mut reader).await {
            if socket.send_to(&datagram, src).await.is_err() {
                break;
            }
            last_seen.store(started.elapsed().as_secs(), Ordering::Relaxed);
        }
    };

    tokio::join!(outbound, inbound);
    debug!("udp flow for {} ended", src);
}
