//! Incremental frame reassembly
//!
//! Socket reads arrive at arbitrary boundaries. [`FrameParser`] keeps every
//! byte it is given and hands back frames only once they are complete.

use super::frame::{peek_payload_len, Frame, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use super::TunnelError;
use tracing::warn;

/// Initial capacity of the reassembly buffer
const INITIAL_CAPACITY: usize = 4096;

/// Streaming frame parser
pub struct FrameParser {
    /// Reassembly buffer; grows on demand and never shrinks
    buffer: Vec<u8>,
    /// Number of valid bytes at the front of `buffer`
    offset: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; INITIAL_CAPACITY],
            offset: 0,
        }
    }

    /// Append incoming bytes
    pub fn add_data(&mut self, data: &[u8]) {
        let needed = self.offset + data.len();
        if needed > self.buffer.len() {
            let grown = (self.buffer.len() * 2).max(needed);
            self.buffer.resize(grown, 0);
        }

        self.buffer[self.offset..needed].copy_from_slice(data);
        self.offset = needed;
    }

    /// Number of buffered bytes not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.offset
    }

    /// Current buffer capacity
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Try to take one complete frame off the front of the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed. A frame with an unknown
    /// type byte is still consumed before the error is returned, so parsing
    /// can carry on with the next frame.
    pub fn try_parse_one(&mut self) -> Result<Option<Frame>, TunnelError> {
        if self.offset < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = peek_payload_len(&self.buffer[..FRAME_HEADER_SIZE]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let total_len = FRAME_HEADER_SIZE + payload_len;
        if self.offset < total_len {
            return Ok(None);
        }

        let result = Frame::decode(&self.buffer[..total_len]);

        // Shift the remaining bytes to the start of the buffer
        self.buffer.copy_within(total_len..self.offset, 0);
        self.offset -= total_len;

        result.map(Some)
    }

    /// Extract every complete frame currently buffered, in arrival order.
    ///
    /// Frames with unknown types are skipped. Oversized frames are fatal
    /// because the stream can no longer be resynchronised.
    pub fn drain_all(&mut self) -> Result<Vec<Frame>, TunnelError> {
        let mut frames = Vec::new();

        loop {
            match self.try_parse_one() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(TunnelError::UnknownMessageType(ty)) => {
                    warn!("Skipping frame with unknown message type {}", ty);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(frames)
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use bytes::Bytes;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::control(MessageType::CryptoExchange, vec![7u8; 32]),
            Frame::new_connection(11),
            Frame::data(11, Bytes::from_static(b"first chunk")),
            Frame::data(22, Bytes::from(vec![0xAB; 9000])),
            Frame::keepalive(),
            Frame::connection_closed(11),
        ]
    }

    fn wire(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.encode().to_vec()).collect()
    }

    #[test]
    fn test_waits_for_full_header() {
        let mut parser = FrameParser::new();
        parser.add_data(&[0, 0, 0, 1]);
        assert!(parser.try_parse_one().unwrap().is_none());
        assert_eq!(parser.buffered(), 4);
    }

    #[test]
    fn test_waits_for_full_payload() {
        let frame = Frame::data(5, Bytes::from_static(b"payload"));
        let encoded = frame.encode();

        let mut parser = FrameParser::new();
        parser.add_data(&encoded[..encoded.len() - 1]);
        assert!(parser.try_parse_one().unwrap().is_none());

        parser.add_data(&encoded[encoded.len() - 1..]);
        assert_eq!(parser.try_parse_one().unwrap(), Some(frame));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_fragmentation_invariance() {
        let frames = sample_frames();
        let bytes = wire(&frames);

        let mut whole = FrameParser::new();
        whole.add_data(&bytes);
        let all_at_once = whole.drain_all().unwrap();

        let mut trickle = FrameParser::new();
        let mut one_at_a_time = Vec::new();
        for byte in &bytes {
            trickle.add_data(std::slice::from_ref(byte));
            one_at_a_time.extend(trickle.drain_all().unwrap());
        }

        assert_eq!(all_at_once, frames);
        assert_eq!(one_at_a_time, frames);
    }

    #[test]
    fn test_uneven_chunks() {
        let frames = sample_frames();
        let bytes = wire(&frames);

        let mut parser = FrameParser::new();
        let mut parsed = Vec::new();
        for chunk in bytes.chunks(7) {
            parser.add_data(chunk);
            parsed.extend(parser.drain_all().unwrap());
        }

        assert_eq!(parsed, frames);
    }

    #[test]
    fn test_buffer_grows_and_never_shrinks() {
        let mut parser = FrameParser::new();
        let big = Frame::data(1, Bytes::from(vec![1u8; INITIAL_CAPACITY * 3]));
        parser.add_data(&big.encode());
        let grown = parser.capacity();
        assert!(grown >= INITIAL_CAPACITY * 3);

        assert_eq!(parser.drain_all().unwrap(), vec![big]);
        assert_eq!(parser.capacity(), grown);
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let mut bogus = Frame::keepalive().encode();
        bogus[4] = 99;
        let good = Frame::data(3, Bytes::from_static(b"ok"));

        let mut parser = FrameParser::new();
        parser.add_data(&bogus);
        parser.add_data(&good.encode());

        assert_eq!(parser.drain_all().unwrap(), vec![good]);
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let header = encode_header(1, (MAX_PAYLOAD_SIZE + 1) as u32);

        let mut parser = FrameParser::new();
        parser.add_data(&header);
        assert!(matches!(
            parser.drain_all(),
            Err(TunnelError::FrameTooLarge(_, _))
        ));
    }

    fn encode_header(connection_id: u32, len: u32) -> Vec<u8> {
        let mut header = connection_id.to_be_bytes().to_vec();
        header.push(MessageType::Data as u8);
        header.extend_from_slice(&len.to_be_bytes());
        header
    }
}
