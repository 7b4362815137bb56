//! Stream multiplexer layer
//!
//! Runs many logical streams over one ordered byte pipe (the AEAD-wrapped
//! HTTP upgrade). Provides framing, keepalive liveness and window-based flow
//! control.

mod frame;
mod multiplexer;
mod stream;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use multiplexer::{MuxSession, Role};
pub use stream::{MuxStream, StreamReader, StreamWriter};

use std::time::Duration;
use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame payload too large: {0}")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Invalid target descriptor: {0}")]
    InvalidTarget(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Multiplexer knobs (the `smux` config section)
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Keepalive ping interval
    pub keepalive: Duration,
    /// Total receive buffer across streams
    pub max_recv: usize,
    /// Per-stream receive window
    pub max_stream: usize,
    /// Maximum DATA frame payload. Small frames resemble typical HTTP
    /// record sizes and make the disguise more convincing.
    pub frame_size: usize,
    /// Protocol version tag
    pub version: u8,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(1),
            max_recv: 512 * 1024,
            max_stream: 512 * 1024,
            frame_size: 2048,
            version: 1,
        }
    }
}

impl MuxConfig {
    /// Dead-session threshold: keepalive interval x 10, with a 10 s floor.
    /// A shorter timeout causes spurious disconnects under load; a longer
    /// one delays detection past the path rotation heuristic.
    pub fn keepalive_timeout(&self) -> Duration {
        (self.keepalive * 10).max(Duration::from_secs(10))
    }

    /// Effective per-stream window, bounded by the session-wide budget.
    pub fn stream_window(&self) -> usize {
        self.max_stream.min(self.max_recv).max(self.frame_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_timeout_floor() {
        let mut cfg = MuxConfig::default();
        assert_eq!(cfg.keepalive_timeout(), Duration::from_secs(10));

        cfg.keepalive = Duration::from_secs(3);
        assert_eq!(cfg.keepalive_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_stream_window_bounded_by_total() {
        let cfg = MuxConfig {
            max_recv: 128 * 1024,
            max_stream: 512 * 1024,
            ..Default::default()
        };
        assert_eq!(cfg.stream_window(), 128 * 1024);
    }
}
