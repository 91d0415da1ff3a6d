//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |       Connection ID (4B, BE)      |
//! +--------+--------+--------+--------+
//! |  Type  |  Payload Length (4B, BE) |
//! +--------+--------+--------+--------+
//! |  ...   |         Payload          |
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use crate::protocol::{MessageType, CONTROL_CONNECTION_ID};
use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 4 + 1 + 4;

/// Largest payload a peer may declare
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Connection ID (0 for control-plane frames)
    pub connection_id: u32,
    /// Message type
    pub message_type: MessageType,
    /// Payload data (empty when the frame carries none)
    pub payload: Bytes,
}

impl Frame {
    pub fn new(connection_id: u32, message_type: MessageType, payload: Bytes) -> Self {
        Self {
            connection_id,
            message_type,
            payload,
        }
    }

    /// Create a control-plane frame on connection 0
    pub fn control(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self::new(CONTROL_CONNECTION_ID, message_type, payload.into())
    }

    /// Create a data frame
    pub fn data(connection_id: u32, payload: Bytes) -> Self {
        Self::new(connection_id, MessageType::Data, payload)
    }

    /// Announce a new outsider connection
    pub fn new_connection(connection_id: u32) -> Self {
        Self::new(connection_id, MessageType::NewConnection, Bytes::new())
    }

    /// Announce that a connection went away
    pub fn connection_closed(connection_id: u32) -> Self {
        Self::new(connection_id, MessageType::ConnectionClosed, Bytes::new())
    }

    pub fn keepalive() -> Self {
        Self::control(MessageType::Keepalive, Bytes::new())
    }

    /// Declared payload length
    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        encode(self.connection_id, self.message_type, &self.payload)
    }

    /// Decode exactly one frame from `buf`.
    ///
    /// The buffer must hold the header and the full payload and nothing else.
    pub fn decode(buf: &[u8]) -> Result<Self, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::MalformedFrame(format!(
                "{} bytes is shorter than the header",
                buf.len()
            )));
        }

        let connection_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

        let payload = &buf[FRAME_HEADER_SIZE..];
        if payload.len() != payload_len {
            return Err(TunnelError::MalformedFrame(format!(
                "declared payload length {} but {} bytes supplied",
                payload_len,
                payload.len()
            )));
        }

        let message_type = MessageType::try_from(buf[4])
            .map_err(|_| TunnelError::UnknownMessageType(buf[4]))?;

        Ok(Self {
            connection_id,
            message_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame from its parts
pub fn encode(connection_id: u32, message_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());

    buf.put_u32(connection_id);
    buf.put_u8(message_type as u8);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);

    buf
}

/// Read the declared payload length from a buffered header
pub(crate) fn peek_payload_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode();

        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
        assert_eq!(decoded.payload_len(), 13);
    }

    #[test]
    fn test_header_layout() {
        let encoded = encode(0x01020304, MessageType::PortAssigned, &[0x1f, 0x90]);
        assert_eq!(
            &encoded[..],
            &[1, 2, 3, 4, 6, 0, 0, 0, 2, 0x1f, 0x90]
        );
    }

    #[test]
    fn test_empty_payload_has_no_trailing_bytes() {
        let frame = Frame::new_connection(7);
        let encoded = frame.encode();

        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        assert_eq!(frame.encoded_size(), FRAME_HEADER_SIZE);

        let decoded = Frame::decode(&encoded).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.message_type, MessageType::NewConnection);
    }

    #[test]
    fn test_decode_short_buffer() {
        let err = Frame::decode(&[0, 0, 0, 1, 1]).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut encoded = Frame::data(1, Bytes::from_static(b"abc")).encode();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            Frame::decode(&encoded),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut encoded = Frame::keepalive().encode();
        encoded[4] = 200;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(TunnelError::UnknownMessageType(200))
        ));
    }

    #[test]
    fn test_round_trip_all_types() {
        for value in 0u8..=10 {
            let ty = MessageType::try_from(value).unwrap();
            let frame = Frame::new(u32::MAX - value as u32, ty, Bytes::from(vec![value; value as usize]));
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }
}
