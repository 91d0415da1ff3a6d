//! Transport layer for the control socket
//!
//! Provides:
//! - TCP connection helpers
//! - A single writer task per control socket that seals and writes frames
//! - Payload sealing/opening rules shared by both ends

mod connection;
mod tcp;

pub use connection::{
    open_frame, seal_frame, spawn_reader, spawn_writer, ControlCommand, FrameSender,
    ReaderMessage,
};
pub use tcp::{connect, read_chunk};

use crate::crypto::CryptoError;
use crate::protocol::MessageType;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{0:?} payload arrived before the session key was established")]
    MissingKey(MessageType),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Capacity of the per-socket outbound frame queue
pub const WRITE_QUEUE_CAPACITY: usize = 256;
