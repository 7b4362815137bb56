//! Padding obfuscation envelope
//!
//! Wraps each record plaintext as `[u16 pad_len][plain][pad_len bytes]` so
//! the DPI-visible record sizes vary after encryption. The padding is random
//! bytes; when there is room, one decoy ASCII fragment (a plausible HTTP
//! header) is planted at a random offset inside it. An optional per-record
//! delay jitters emission timing.
//!
//! The two-byte header is always present on the wire, even when obfuscation
//! is disabled (pad_len is then zero), so both peers agree on the layout
//! without negotiating.

use crate::crypto::{random_bytes, random_range};
use std::time::Duration;
use thiserror::Error;

/// Minimum padding length that gets a decoy fragment planted inside it
const DECOY_THRESHOLD: usize = 12;

/// Plausible HTTP header fragments scattered into padding regions
const DECOY_FRAGMENTS: &[&[u8]] = &[
    b"Cache-Control: max-age=0",
    b"Accept-Encoding: gzip, deflate, br",
    b"X-Requested-With: XMLHttpRequest",
    b"Content-Type: text/html; charset=UTF-8",
    b"Vary: Accept-Encoding",
    b"X-Content-Type-Options: nosniff",
];

/// Obfuscation envelope errors
#[derive(Debug, Error)]
pub enum ObfsError {
    #[error("Envelope too short")]
    Truncated,

    #[error("Padding length {pad} exceeds payload {len}")]
    BadPadding { pad: usize, len: usize },
}

/// Obfuscation knobs
#[derive(Debug, Clone)]
pub struct ObfsParams {
    pub enabled: bool,
    pub min_padding: usize,
    pub max_padding: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ObfsParams {
    fn default() -> Self {
        Self {
            enabled: false,
            min_padding: 0,
            max_padding: 0,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl ObfsParams {
    /// Wrap `data` in the padding envelope.
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        let pad = if self.enabled && self.max_padding > 0 {
            random_range(self.min_padding as u64, self.max_padding as u64) as usize
        } else {
            0
        };

        let mut out = Vec::with_capacity(2 + data.len() + pad);
        out.extend_from_slice(&(pad as u16).to_be_bytes());
        out.extend_from_slice(data);

        if pad > 0 {
            let start = out.len();
            out.resize(start + pad, 0);
            random_bytes(&mut out[start..]);

            if pad > DECOY_THRESHOLD {
                let decoy = DECOY_FRAGMENTS
                    [random_range(0, DECOY_FRAGMENTS.len() as u64 - 1) as usize];
                let take = decoy.len().min(pad);
                let offset = random_range(0, (pad - take) as u64) as usize;
                out[start + offset..start + offset + take].copy_from_slice(&decoy[..take]);
            }
        }

        out
    }

    /// Remove the padding envelope, returning the inner bytes.
    pub fn strip(&self, data: &[u8]) -> Result<Vec<u8>, ObfsError> {
        if data.len() < 2 {
            return Err(ObfsError::Truncated);
        }
        let pad = u16::from_be_bytes([data[0], data[1]]) as usize;
        let body = &data[2..];
        if pad > body.len() {
            return Err(ObfsError::BadPadding { pad, len: body.len() });
        }
        Ok(body[..body.len() - pad].to_vec())
    }

    /// Sleep a random delay in `[min_delay_ms, max_delay_ms]` before emitting
    /// a record. No-op when disabled or unconfigured.
    pub async fn delay(&self) {
        if !self.enabled || self.max_delay_ms == 0 {
            return;
        }
        let ms = random_range(self.min_delay_ms, self.max_delay_ms);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
