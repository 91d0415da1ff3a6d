//! Reader and writer tasks for a control socket
//!
//! Every producer (session logic, outsider readers, local tunnel readers)
//! hands plaintext frames to one writer task through a bounded queue. The
//! writer owns the write half and the sealing cipher, so two frame bodies
//! can never interleave on the wire and nonces are used in send order.
//!
//! A dedicated reader task owns the read half and the frame parser and
//! forwards complete frames in the order their bytes arrived.

use super::{read_chunk, TransportError, WRITE_QUEUE_CAPACITY};
use crate::crypto::Cipher;
use crate::tunnel::{Frame, FrameParser, READ_CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Message from the reader task
#[derive(Debug)]
pub enum ReaderMessage {
    /// Frames completed by one read, in wire order
    Frames(Vec<Frame>),
    /// Reader encountered an error; the stream is unusable
    Error(String),
    /// Peer closed the connection
    Closed,
}

/// Spawn the reader task for `read_half`
pub fn spawn_reader<R>(read_half: R) -> (mpsc::Receiver<ReaderMessage>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let handle = tokio::spawn(run_reader(read_half, tx));
    (rx, handle)
}

async fn run_reader<R>(mut read_half: R, tx: mpsc::Sender<ReaderMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match read_chunk(&mut read_half, &mut buf).await {
            Ok(0) => {
                let _ = tx.send(ReaderMessage::Closed).await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(ReaderMessage::Error(e.to_string())).await;
                return;
            }
        };

        parser.add_data(&buf[..n]);
        let message = match parser.drain_all() {
            Ok(frames) if frames.is_empty() => continue,
            Ok(frames) => ReaderMessage::Frames(frames),
            Err(e) => {
                let _ = tx.send(ReaderMessage::Error(e.to_string())).await;
                return;
            }
        };

        if tx.send(message).await.is_err() {
            // Session loop is gone
            return;
        }
    }
}

/// Command for the writer task
pub enum ControlCommand {
    /// Seal (when required) and write a frame
    Send(Frame),
    /// Start sealing payloads with this cipher
    Secure(Cipher),
    /// Flush what is queued, then shut the socket down
    Shutdown,
}

/// Cloneable handle to a control socket's writer task
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<ControlCommand>,
}

impl FrameSender {
    /// Wrap an existing command queue
    pub fn new(tx: mpsc::Sender<ControlCommand>) -> Self {
        Self { tx }
    }

    /// Queue a frame; waits while the queue is full
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(ControlCommand::Send(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Install the sealing cipher. Frames queued earlier still go out as they were.
    pub async fn secure(&self, cipher: Cipher) -> Result<(), TransportError> {
        self.tx
            .send(ControlCommand::Secure(cipher))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Ask the writer to flush and close the socket
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ControlCommand::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task for `write_half`
pub fn spawn_writer<W>(write_half: W) -> (FrameSender, JoinHandle<Result<(), TransportError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let handle = tokio::spawn(run_writer(write_half, rx));
    (FrameSender::new(tx), handle)
}

async fn run_writer<W>(
    mut write_half: W,
    mut rx: mpsc::Receiver<ControlCommand>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut cipher: Option<Cipher> = None;

    while let Some(command) = rx.recv().await {
        match command {
            ControlCommand::Send(frame) => {
                trace!(
                    "Sending {:?} [connectionId: {}] {} bytes",
                    frame.message_type,
                    frame.connection_id,
                    frame.payload.len()
                );
                let wire = seal_frame(cipher.as_mut(), frame)?;
                write_half.write_all(&wire).await?;
            }
            ControlCommand::Secure(new_cipher) => {
                cipher = Some(new_cipher);
            }
            ControlCommand::Shutdown => break,
        }
    }

    debug!("Control writer finished");
    write_half.shutdown().await.ok();
    Ok(())
}

/// Header fields the AEAD tag is bound to, so a sealed payload cannot be
/// replayed under another connection ID or message type.
fn associated_data(frame: &Frame) -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(&frame.connection_id.to_be_bytes());
    aad[4] = frame.message_type as u8;
    aad
}

fn needs_sealing(frame: &Frame) -> bool {
    frame.message_type.is_sealed() && !frame.payload.is_empty()
}

/// Encode `frame` for the wire, sealing its payload when the type requires it
pub fn seal_frame(cipher: Option<&mut Cipher>, frame: Frame) -> Result<BytesMut, TransportError> {
    if !needs_sealing(&frame) {
        return Ok(frame.encode());
    }

    let cipher = cipher.ok_or(TransportError::MissingKey(frame.message_type))?;
    let sealed = cipher.encrypt(&associated_data(&frame), &frame.payload)?;

    Ok(Frame::new(frame.connection_id, frame.message_type, Bytes::from(sealed)).encode())
}

/// Replace a received frame's sealed payload with its plaintext
pub fn open_frame(cipher: Option<&mut Cipher>, frame: Frame) -> Result<Frame, TransportError> {
    if !needs_sealing(&frame) {
        return Ok(frame);
    }

    let cipher = cipher.ok_or(TransportError::MissingKey(frame.message_type))?;
    let plaintext = cipher.decrypt(&associated_data(&frame), &frame.payload)?;

    Ok(Frame::new(
        frame.connection_id,
        frame.message_type,
        Bytes::from(plaintext),
    ))
}
