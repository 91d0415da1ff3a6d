//! Tunnel layer - framing over a raw byte stream
//!
//! Provides:
//! - Frame encoding/decoding
//! - Streaming reassembly of frames split across reads

mod frame;
mod parser;

pub use frame::{encode, Frame, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use parser::FrameParser;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),
}

/// Size of a single socket read; also the largest DATA payload we emit
pub const READ_CHUNK_SIZE: usize = 64 * 1024;
