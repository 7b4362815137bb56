//! Byte relays and the peer-side stream handler
//!
//! Once a logical stream is bound to a local socket, two copy tasks pump
//! bytes in both directions with 32 KiB buffers. A normal end-of-stream in
//! one direction is not an error; it closes the reciprocal endpoint so the
//! other direction unblocks, and both tasks are awaited before returning.
//!
//! UDP payloads are framed `[u16 len][datagram]` inside the stream so
//! datagram boundaries survive the ordered byte pipe.

use crate::tunnel::{StreamReader, StreamWriter, TunnelError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::debug;

/// Copy buffer per relay direction
const RELAY_BUF: usize = 32 * 1024;

/// Deadline for reading the target header on a fresh stream
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for dialing the target
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle timeout for peer-side UDP sockets
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Target descriptor protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// Parse a `proto://host:port` target descriptor.
pub fn parse_target(descriptor: &str) -> Result<(Proto, &str), TunnelError> {
    let (proto, rest) = if let Some(rest) = descriptor.strip_prefix("tcp://") {
        (Proto::Tcp, rest)
    } else if let Some(rest) = descriptor.strip_prefix("udp://") {
        (Proto::Udp, rest)
    } else {
        return Err(TunnelError::InvalidTarget(descriptor.to_string()));
    };

    if rest.is_empty() || rest.contains('/') || !rest.contains(':') {
        return Err(TunnelError::InvalidTarget(descriptor.to_string()));
    }
    Ok((proto, rest))
}

/// Relay between a TCP socket and a logical stream until both directions
/// finish.
pub async fn pipe_tcp(tcp: TcpStream, stream_r: StreamReader, mut stream_w: StreamWriter) {
    let (mut tcp_r, mut tcp_w) = tcp.into_split();
    let done = Arc::new(Notify::new());
    let mut stream_r = stream_r;

    let tcp_to_stream = {
        let done = done.clone();
        async move {
            let mut buf = vec![0u8; RELAY_BUF];
            loop {
                tokio::select! {
                    _ = done.notified() => break,
                    read = tcp_r.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream_w.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            stream_w.close().await;
            done.notify_one();
        }
    };

    let stream_to_tcp = {
        let done = done.clone();
        async move {
            loop {
                tokio::select! {
                    _ = done.notified() => break,
                    chunk = stream_r.read_chunk() => match chunk {
                        Some(bytes) => {
                            if tcp_w.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = tcp_w.shutdown().await;
            done.notify_one();
        }
    };

    tokio::join!(tcp_to_stream, stream_to_tcp);
}

/// Handle one stream accepted from the peer: read the target descriptor,
/// dial it, relay. Any failure drops the stream silently (the drop sends a
/// close frame; the application never sees tunnel-specific errors).
pub async fn handle_peer_stream(stream: crate::tunnel::MuxStream) {
    let (mut reader, writer) = stream.into_split();

    let descriptor = match timeout(HEADER_TIMEOUT, read_target_header(&mut reader)).await {
        Ok(Ok(d)) => d,
        Ok(Err(e)) => {
            debug!("bad target header: {}", e);
            return;
        }
        Err(_) => {
            debug!("target header timed out");
            return;
        }
    };

    let (proto, addr) = match parse_target(&descriptor) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("unparseable target: {}", e);
            return;
        }
    };

    match proto {
        Proto::Tcp => {
            let tcp = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(tcp)) => tcp,
                Ok(Err(e)) => {
                    debug!("dial {} failed: {}", addr, e);
                    return;
                }
                Err(_) => {
                    debug!("dial {} timed out", addr);
                    return;
                }
            };
            let _ = tcp.set_nodelay(true);
            debug!("stream {} relaying to {}", reader.id(), addr);
            pipe_tcp(tcp, reader, writer).await;
        }
        Proto::Udp => {
            let socket = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(e) => {
                    debug!("udp bind failed: {}", e);
                    return;
                }
            };
            if let Err(e) = socket.connect(addr).await {
                debug!("udp connect {} failed: {}", addr, e);
                return;
            }
            debug!("stream {} relaying datagrams to {}", reader.id(), addr);
            pipe_udp_peer(socket, reader, writer).await;
        }
    }
}

async fn read_target_header(reader: &mut StreamReader) -> Result<String, TunnelError> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > crate::pool::MAX_TARGET_LEN {
        return Err(TunnelError::InvalidTarget(format!("header length {}", len)));
    }

    let mut name = vec![0u8; len];
    reader.read_exact(&mut name).await?;
    String::from_utf8(name).map_err(|_| TunnelError::InvalidTarget("non-ASCII".to_string()))
}

/// Read one length-prefixed datagram from a stream.
pub(crate) async fn read_datagram(reader: &mut StreamReader) -> Option<Bytes> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await.ok()?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.ok()?;
    Some(Bytes::from(payload))
}

/// Write one length-prefixed datagram to a stream. Oversized datagrams are
/// dropped rather than truncated.
pub(crate) async fn write_datagram(
    writer: &mut StreamWriter,
    payload: &[u8],
) -> Result<(), TunnelError> {
    if payload.len() > u16::MAX as usize {
        return Ok(());
    }
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    writer.write_all(&framed).await
}

async fn pipe_udp_peer(socket: UdpSocket, mut reader: StreamReader, mut writer: StreamWriter) {
    let socket = Arc::new(socket);

    let outbound = {
        let socket = socket.clone();
        async move {
            while let Some(datagram) = read_datagram(&mut reader).await {
                if socket.send(&datagram).await.is_err() {
                    break;
                }
            }
        }
    };

    let inbound = async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match timeout(UDP_IDLE_TIMEOUT, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if write_datagram(&mut writer, &buf[..n]).await.is_err() {
                        break;
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
        writer.close().await;
    };

    tokio::join!(outbound, inbound);
}
