//! Frame codec for the multiplexer
//!
//! Frame layout (big-endian):
//! ```text
//! +------------+--------+------------+=================+
//! | stream id  |  type  |   length   |     payload     |
//! |  4 bytes   | 1 byte |  4 bytes   |  length bytes   |
//! +------------+--------+------------+=================+
//! ```
//!
//! Stream 0 is the control stream: PING/PONG ride on it, and a DATA frame on
//! stream 0 carries a window grant (`[u32 stream_id][u32 credit]`). Real
//! streams start at id 1 (client) and 2 (server), so the two uses can never
//! collide.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum payload the codec will accept (the multiplexer keeps effective
/// frames far smaller)
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload (control message when stream id is 0)
    Data = 0x01,
    /// Keepalive probe
    Ping = 0x02,
    /// Keepalive reply
    Pong = 0x03,
    /// Sender will transmit no more data on this stream
    Close = 0x04,
    /// Open a new logical stream
    Open = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Ping),
            0x03 => Ok(FrameType::Pong),
            0x04 => Ok(FrameType::Close),
            0x05 => Ok(FrameType::Open),
            _ => Err(TunnelError::InvalidFrame(format!(
                "unknown frame type: {:#04x}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream open frame
    pub fn open(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a keepalive ping
    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Create a keepalive reply, echoing the probe payload
    pub fn pong(payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload,
        }
    }

    /// Create a window grant for `stream_id`, carried on the control stream
    pub fn window_grant(stream_id: u32, credit: u32) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(stream_id);
        payload.put_u32(credit);
        Self {
            frame_type: FrameType::Data,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Parse a window grant payload
    pub fn parse_window_grant(payload: &[u8]) -> Result<(u32, u32), TunnelError> {
        if payload.len() != 8 {
            return Err(TunnelError::InvalidFrame(format!(
                "window grant of {} bytes",
                payload.len()
            )));
        }
        let sid = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let credit = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        Ok((sid, credit))
    }

    /// Encode this frame into a fresh buffer
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame from the front of `buf`. Returns `Ok(None)` when the
    /// buffer does not yet hold a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let stream_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let frame_type = FrameType::try_from(buf[4])?;
        let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

        if length > MAX_FRAME_PAYLOAD {
            return Err(TunnelError::FrameTooLarge(length));
        }
        if buf.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, Mirage!"));
        let mut encoded = original.encode();

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(&decoded.payload[..], b"Hello, Mirage!");
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_partial_header_needs_more() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0x01][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_partial_payload_needs_more() {
        let frame = Frame::data(7, Bytes::from_static(b"abcdef"));
        let encoded = frame.encode();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 2]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = Frame::ping().encode();
        buf.extend_from_slice(&Frame::data(3, Bytes::from_static(b"xy")).encode());

        let a = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(a.frame_type, FrameType::Ping);
        let b = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(b.frame_type, FrameType::Data);
        assert_eq!(b.stream_id, 3);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0x09);
        buf.put_u32(0);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0x01);
        buf.put_u32((MAX_FRAME_PAYLOAD + 1) as u32);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(TunnelError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_window_grant_roundtrip() {
        let frame = Frame::window_grant(11, 65536);
        assert_eq!(frame.stream_id, 0);
        let (sid, credit) = Frame::parse_window_grant(&frame.payload).unwrap();
        assert_eq!(sid, 11);
        assert_eq!(credit, 65536);
    }
}
