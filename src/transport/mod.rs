//! Transport layer — the connection-path state machine
//!
//! A disguised transport is built in stages:
//!
//! ```text
//! dial → fragment → TLS-mimic → HTTP-upgrade → AEAD envelope → mux session
//! ```
//!
//! [`establish`] runs the client side of that pipeline for one configured
//! path; [`accept`] runs the server side on an inbound connection. Both end
//! in a live [`MuxSession`], and any stage failure discards the whole
//! transport.

mod fragment;
pub mod record;
pub mod tls;

pub use fragment::{FragmentParams, FragmentedStream};

use crate::config::{Config, PathSettings, TransportKind};
use crate::crypto::{CryptoError, EnvelopeKey};
use crate::mimic;
use crate::obfs::ObfsError;
use crate::tunnel::{MuxSession, Role};
use crate::Error;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Object-safe byte pipe used between pipeline stages
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A boxed pipeline stage
pub type BoxedIo = Box<dyn Io>;

/// Transport layer errors
#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Envelope error: {0}")]
    Obfs(#[from] ObfsError),

    #[error("Record length {0} out of bounds")]
    RecordTooLarge(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Dial one configured path and run the full client pipeline, returning a
/// registered-ready mux session.
pub async fn establish(path: &PathSettings, cfg: &Config) -> crate::Result<Arc<MuxSession>> {
    let tcp = tokio::time::timeout(path.dial_timeout, TcpStream::connect(&path.addr))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::Io)?;
    tcp.set_nodelay(true)?;
    if let Some(interval) = cfg.tcp_keepalive {
        apply_tcp_keepalive(&tcp, interval)?;
    }

    let mut io: BoxedIo = if cfg.fragment.enabled {
        Box::new(FragmentedStream::new(tcp, cfg.fragment.clone()))
    } else {
        Box::new(tcp)
    };

    if path.transport == TransportKind::TlsHttpMimic {
        let sni = if cfg.mimic.fake_domain.is_empty() {
            host_of(&path.addr).to_string()
        } else {
            cfg.mimic.fake_domain.clone()
        };
        debug!("starting TLS mimic handshake, sni={}", sni);
        io = Box::new(tls::connect_mimic(io, &sni, cfg.tls_profile).await?);
    }

    let upgraded = mimic::client_handshake(io, &cfg.mimic).await?;
    let key = EnvelopeKey::derive(&cfg.psk);
    Ok(MuxSession::start(
        upgraded,
        key,
        cfg.obfs.clone(),
        cfg.mux.clone(),
        Role::Client,
    ))
}

/// Run the server side of the pipeline on an accepted tunnel connection.
/// Returns an error (after the decoy has answered) for anything that is not
/// a valid upgrade.
pub async fn accept(
    conn: TcpStream,
    acceptor: Option<&TlsAcceptor>,
    cfg: &Config,
) -> crate::Result<Arc<MuxSession>> {
    conn.set_nodelay(true)?;

    let io: BoxedIo = match acceptor {
        Some(acceptor) => Box::new(
            acceptor
                .accept(conn)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ),
        None => Box::new(conn),
    };

    let upgraded = mimic::server_handshake(io, &cfg.mimic).await?;
    let key = EnvelopeKey::derive(&cfg.psk);
    Ok(MuxSession::start(
        upgraded,
        key,
        cfg.obfs.clone(),
        cfg.mux.clone(),
        Role::Server,
    ))
}

fn apply_tcp_keepalive(tcp: &TcpStream, interval: Duration) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(interval)
        .with_interval(interval);
    socket2::SockRef::from(tcp).set_tcp_keepalive(&keepalive)
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}
