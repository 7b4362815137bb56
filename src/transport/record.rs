//! AEAD record layer
//!
//! Converts the opaque byte pipe left after the HTTP upgrade into an
//! authenticated byte pipe. Writes buffer application bytes into records of
//! bounded size, wrap each in the padding envelope, seal it, and emit
//! `[u32 record_len][nonce||ciphertext||tag]`. Reads are the inverse. A
//! failed open is fatal: the caller discards the whole transport.

use super::TransportError;
use crate::crypto::EnvelopeKey;
use crate::obfs::ObfsParams;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one record's plaintext chunk
pub const MAX_RECORD_PAYLOAD: usize = 32 * 1024;

/// Sanity bound on a wire record (payload + maximum padding + AEAD overhead)
const MAX_WIRE_RECORD: usize = 128 * 1024;

/// Writing half of the envelope
pub struct RecordWriter<W> {
    io: W,
    key: Option<EnvelopeKey>,
    obfs: ObfsParams,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(io: W, key: Option<EnvelopeKey>, obfs: ObfsParams) -> Self {
        Self { io, key, obfs }
    }

    /// Emit `payload` as one or more sealed records.
    pub async fn write_record(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        for chunk in payload.chunks(MAX_RECORD_PAYLOAD) {
            self.obfs.delay().await;

            let body = self.obfs.apply(chunk);
            let sealed = match &self.key {
                Some(key) => key.seal(&body)?,
                None => body,
            };

            let mut wire = Vec::with_capacity(4 + sealed.len());
            wire.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
            wire.extend_from_slice(&sealed);
            self.io.write_all(&wire).await?;
        }
        self.io.flush().await?;
        Ok(())
    }
}

/// Reading half of the envelope
pub struct RecordReader<R> {
    io: R,
    key: Option<EnvelopeKey>,
    obfs: ObfsParams,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(io: R, key: Option<EnvelopeKey>, obfs: ObfsParams) -> Self {
        Self { io, key, obfs }
    }

    /// Read, verify and unwrap the next record.
    pub async fn read_record(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        self.io.read_exact(&mut len_buf).await.map_err(map_eof)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_WIRE_RECORD {
            return Err(TransportError::RecordTooLarge(len));
        }

        let mut body = vec![0u8; len];
        self.io.read_exact(&mut body).await.map_err(map_eof)?;

        let plain = match &self.key {
            Some(key) => key.open(&body)?,
            None => body,
        };
        Ok(self.obfs.strip(&plain)?)
    }
}

fn map_eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoError;

    fn obfs(max_pad: usize) -> ObfsParams {
        ObfsParams {
            enabled: max_pad > 0,
            min_padding: 0,
            max_padding: max_pad,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let key = EnvelopeKey::derive("shared-secret");
        let mut writer = RecordWriter::new(a, key.clone(), obfs(64));
        let mut reader = RecordReader::new(b, key, obfs(64));

        writer.write_record(b"first record").await.unwrap();
        writer.write_record(b"second record").await.unwrap();

        assert_eq!(reader.read_record().await.unwrap(), b"first record");
        assert_eq!(reader.read_record().await.unwrap(), b"second record");
    }

    #[tokio::test]
    async fn test_passthrough_without_psk() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = RecordWriter::new(a, None, obfs(0));
        let mut reader = RecordReader::new(b, None, obfs(0));

        writer.write_record(b"diagnostic bytes").await.unwrap();
        assert_eq!(reader.read_record().await.unwrap(), b"diagnostic bytes");
    }

    #[tokio::test]
    async fn test_large_payload_splits_into_records() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let key = EnvelopeKey::derive("k");
        let mut writer = RecordWriter::new(a, key.clone(), obfs(0));
        let mut reader = RecordReader::new(b, key, obfs(0));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        writer.write_record(&payload).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            received.extend_from_slice(&reader.read_record().await.unwrap());
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_wrong_key_is_fatal() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = RecordWriter::new(a, EnvelopeKey::derive("A"), obfs(16));
        let mut reader = RecordReader::new(b, EnvelopeKey::derive("B"), obfs(16));

        writer.write_record(b"mismatch").await.unwrap();
        assert!(matches!(
            reader.read_record().await,
            Err(TransportError::Crypto(CryptoError::Open))
        ));
    }

    #[tokio::test]
    async fn test_eof_maps_to_closed() {
        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let mut reader = RecordReader::new(b, None, obfs(0));
        assert!(matches!(
            reader.read_record().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_bogus_length_rejected() {
        let (mut a, b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut a, &u32::MAX.to_be_bytes())
            .await
            .unwrap();
        let mut reader = RecordReader::new(b, None, obfs(0));
        assert!(matches!(
            reader.read_record().await,
            Err(TransportError::RecordTooLarge(_))
        ));
    }
}
