//! AEAD record envelope
//!
//! Each sealed record body is `[12-byte nonce][ciphertext || 16-byte tag]`.
//! The key is SHA-256 of the pre-shared key string, so both peers derive it
//! independently and no key material is ever stored. Nonces are drawn fresh
//! from the CSPRNG per record; collision probability over an AES-GCM stream
//! bounded by network throughput is negligible, and random nonces keep
//! reconnection stateless.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use std::sync::Arc;

/// Sealing/opening key derived from the PSK.
///
/// Cheap to clone; the underlying key material is shared.
#[derive(Clone)]
pub struct EnvelopeKey {
    key: Arc<LessSafeKey>,
}

impl EnvelopeKey {
    /// Derive a key from a pre-shared key string.
    ///
    /// Returns `None` for an empty PSK: the envelope then runs in
    /// pass-through mode (diagnostics only, never production).
    pub fn derive(psk: &str) -> Option<Self> {
        if psk.is_empty() {
            return None;
        }
        let sum = digest::digest(&digest::SHA256, psk.as_bytes());
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(sum.as_ref());
        let unbound =
            UnboundKey::new(&AES_256_GCM, &key_bytes).expect("SHA-256 output is a valid AES key");
        Some(Self {
            key: Arc::new(LessSafeKey::new(unbound)),
        })
    }

    /// Seal a plaintext record body, returning `[nonce][ciphertext||tag]`.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        random_bytes(&mut nonce_bytes);

        let mut out = Vec::with_capacity(NONCE_LEN + plain.len() + TAG_LEN);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(plain);

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut out[NONCE_LEN..])
            .map_err(|_| CryptoError::Seal)?;
        out.extend_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Open a sealed record body. A failed open is fatal for the record; the
    /// containing transport must be discarded.
    pub fn open(&self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&body[..NONCE_LEN]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = body[NONCE_LEN..].to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| CryptoError::Open)?;
        Ok(plain.to_vec())
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvelopeKey")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EnvelopeKey::derive("test-psk").unwrap();
        let plain = b"the quick brown fox";

        let sealed = key.seal(plain).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + plain.len() + TAG_LEN);

        let opened = key.open(&sealed).unwrap();
        assert_eq!(opened, plain);
    }

    #[test]
    fn test_empty_psk_is_passthrough() {
        assert!(EnvelopeKey::derive("").is_none());
        assert!(EnvelopeKey::derive("x").is_some());
    }

    #[test]
    fn test_tamper_detection() {
        let key = EnvelopeKey::derive("test-psk").unwrap();
        let mut sealed = key.seal(b"payload").unwrap();
        sealed[NONCE_LEN] ^= 0xff;
        assert!(matches!(key.open(&sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn test_wrong_psk_fails() {
        let a = EnvelopeKey::derive("A").unwrap();
        let b = EnvelopeKey::derive("B").unwrap();
        let sealed = a.seal(b"payload").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_truncated_record() {
        let key = EnvelopeKey::derive("test-psk").unwrap();
        assert!(matches!(
            key.open(&[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(CryptoError::Truncated)
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = EnvelopeKey::derive("test-psk").unwrap();
        let a = key.seal(b"same").unwrap();
        let b = key.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = EnvelopeKey::derive("test-psk").unwrap();
        let sealed = key.seal(b"").unwrap();
        assert_eq!(key.open(&sealed).unwrap(), Vec::<u8>::new());
    }
}
