//! Local service connections
//!
//! Each NEW_CONNECTION spawns one task that dials the local service. The
//! session learns the outcome through [`LocalEvent`]s, so it never blocks on
//! a connect and can buffer DATA that arrives in the meantime.

use crate::transport::{connect, FrameSender};
use crate::tunnel::{Frame, READ_CHUNK_SIZE};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Outcome reported by a local tunnel task
#[derive(Debug)]
pub enum LocalEvent {
    /// Local socket is open; `tx` feeds bytes to it
    Connected {
        connection_id: u32,
        tx: mpsc::UnboundedSender<Bytes>,
    },
    /// Local service could not be reached
    Failed { connection_id: u32, error: String },
    /// Local socket closed or errored after connecting
    Closed { connection_id: u32 },
}

/// A local tunnel as tracked by the session
#[derive(Debug)]
pub enum LocalTunnel {
    /// Dial in progress; payloads wait here in arrival order. `closing` is
    /// set when the server closed the connection before the socket opened.
    Connecting {
        pending: VecDeque<Bytes>,
        closing: bool,
    },
    /// Socket open
    Open { tx: mpsc::UnboundedSender<Bytes> },
}

impl LocalTunnel {
    pub fn connecting() -> Self {
        LocalTunnel::Connecting {
            pending: VecDeque::new(),
            closing: false,
        }
    }

    /// Deliver `payload`, buffering while the socket is still connecting
    pub fn push(&mut self, payload: Bytes) {
        match self {
            LocalTunnel::Connecting { pending, .. } => pending.push_back(payload),
            LocalTunnel::Open { tx } => {
                let _ = tx.send(payload);
            }
        }
    }

    /// Flush buffered payloads into `tx` and switch to open
    pub fn open(&mut self, tx: mpsc::UnboundedSender<Bytes>) {
        if let LocalTunnel::Connecting { pending, .. } = self {
            for payload in pending.drain(..) {
                let _ = tx.send(payload);
            }
        }
        *self = LocalTunnel::Open { tx };
    }

    /// Close the socket once it has opened and received what is buffered
    pub fn close_after_flush(&mut self) {
        if let LocalTunnel::Connecting { closing, .. } = self {
            *closing = true;
        }
    }

    /// Whether the server already closed this connection
    pub fn is_closing(&self) -> bool {
        matches!(self, LocalTunnel::Connecting { closing: true, .. })
    }

    /// Number of payloads still waiting for the socket, if connecting
    pub fn pending_len(&self) -> Option<usize> {
        match self {
            LocalTunnel::Connecting { pending, .. } => Some(pending.len()),
            LocalTunnel::Open { .. } => None,
        }
    }
}

/// Dial `addr` for `connection_id` in the background. The task belongs to
/// `tasks` and is aborted with it.
pub fn spawn_local_tunnel(
    tasks: &mut JoinSet<()>,
    connection_id: u32,
    addr: String,
    timeout: Duration,
    sender: FrameSender,
    events: mpsc::UnboundedSender<LocalEvent>,
) {
    tasks.spawn(async move {
        let stream = match connect(&addr, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open local tunnel {} to {}: {}", connection_id, addr, e);
                let _ = events.send(LocalEvent::Failed {
                    connection_id,
                    error: e.to_string(),
                });
                return;
            }
        };
        debug!("Local tunnel {} connected to {}", connection_id, addr);

        let (tx, rx) = mpsc::unbounded_channel();
        if events
            .send(LocalEvent::Connected { connection_id, tx })
            .is_err()
        {
            return;
        }

        relay_local(connection_id, stream, rx, sender).await;
        let _ = events.send(LocalEvent::Closed { connection_id });
    });
}

async fn relay_local(
    connection_id: u32,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    sender: FrameSender,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let to_server = async {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    trace!("Local tunnel {} read {} bytes", connection_id, n);
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if sender.send(Frame::data(connection_id, data)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Local tunnel {} read error: {}", connection_id, e);
                    break;
                }
            }
        }
    };

    let to_local = async {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                debug!("Local tunnel {} write error: {}", connection_id, e);
                return;
            }
        }
        write_half.shutdown().await.ok();
    };

    tokio::select! {
        _ = to_server => {}
        _ = to_local => {}
    }
}
