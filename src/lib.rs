//! # Mirage Tunnel
//!
//! An anti-censorship TCP/UDP tunnel that forwards arbitrary byte streams
//! across a hostile network path. Every tunnel connection is disguised as an
//! HTTP/1.1 WebSocket upgrade to a plausible fake host, optionally wrapped in
//! TLS with a browser-grade ClientHello and TCP-level record fragmentation,
//! and the body bytes are authenticated-encrypted with a padded,
//! delay-jittered envelope.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                    │
//! │      (TCP/UDP listeners, reverse stream dispatch)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │       (logical streams, keepalive, flow windows)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Envelope Layer                      │
//! │      (AES-256-GCM records, padding obfuscation)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Disguise Layer                      │
//! │   (HTTP upgrade mimicry, TLS fingerprint, decoys)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │          (TCP dial, record fragmentation)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connector;
pub mod crypto;
pub mod listener;
pub mod mimic;
pub mod obfs;
pub mod pool;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use pool::SessionPool;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Handshake error: {0}")]
    Mimic(#[from] mimic::MimicError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No live session available")]
    NoSession,

    #[error("Timeout")]
    Timeout,
}
