//! Cryptographic primitives for Mirage Tunnel
//!
//! This module provides:
//! - AES-256-GCM record sealing keyed by SHA-256(PSK)
//! - Secure random number generation (nonces, padding, jitter)
//!
//! There is no key exchange: peer identity is authenticated solely by
//! possession of the pre-shared key. Each record carries a fresh random
//! 96-bit nonce so reconnection needs no counter state.

mod envelope;

pub use envelope::EnvelopeKey;

use thiserror::Error;

/// Length of the derived symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the per-record nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Seal,

    #[error("Authentication failed")]
    Open,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Record too short")]
    Truncated,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system RNG failure");
}

/// Uniform random value in `[lo, hi]` (inclusive). Returns `lo` when the
/// range is empty or inverted.
pub fn random_range(lo: u64, hi: u64) -> u64 {
    if hi <= lo {
        return lo;
    }
    let mut buf = [0u8; 8];
    random_bytes(&mut buf);
    lo + u64::from_le_bytes(buf) % (hi - lo + 1)
}

/// Random alphanumeric string of length `n` (for `{rand}` path substitution)
pub fn random_alphanum(n: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut buf = vec![0u8; n];
    random_bytes(&mut buf);
    buf.iter().map(|b| CHARS[*b as usize % CHARS.len()] as char).collect()
}

/// Lowercase hex encoding of `n` random bytes (WebSocket keys, session cookies)
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    random_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_range_bounds() {
        for _ in 0..200 {
            let v = random_range(64, 191);
            assert!((64..=191).contains(&v));
        }
        assert_eq!(random_range(5, 5), 5);
        assert_eq!(random_range(9, 3), 9);
    }

    #[test]
    fn test_random_alphanum() {
        let s = random_alphanum(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_random_hex() {
        let s = random_hex(16);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
