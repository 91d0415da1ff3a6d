//! Tunnel listeners and outsider connection routing
//!
//! Each active session owns one `TunnelListener`. Every outsider accepted
//! on it gets a random connection ID and a relay task; the listener's
//! connection table maps that ID to the queue feeding the outsider socket.

use super::registry::{PortLease, Registry};
use crate::config::ServerConfig;
use crate::crypto::{random_u32, CryptoError};
use crate::protocol::{PortRequest, CONTROL_CONNECTION_ID};
use crate::transport::FrameSender;
use crate::tunnel::{Frame, READ_CHUNK_SIZE};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Ephemeral binds tried before falling back to random in-range ports
const EPHEMERAL_ATTEMPTS: usize = 16;

/// Total bind attempts before a port request is answered UNAVAILABLE
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// Outsider connections of one listener, keyed by connection ID
pub type ConnectionTable = Arc<DashMap<u32, mpsc::UnboundedSender<Bytes>>>;

/// Bind a listener for `request` and lease its port.
///
/// Returns `None` when the port is out of range, leased, reserved, or no
/// bindable port could be found.
pub async fn allocate(
    config: &ServerConfig,
    registry: &Arc<Registry>,
    request: PortRequest,
) -> Option<(TcpListener, PortLease)> {
    match request {
        PortRequest::Specific(port) => {
            if !config.port_in_range(port) {
                debug!("Requested port {} is outside {}-{}", port, config.min_port, config.max_port);
                return None;
            }
            bind_leased(config, registry, port).await
        }
        PortRequest::Any => allocate_any(config, registry).await,
    }
}

async fn bind_leased(
    config: &ServerConfig,
    registry: &Arc<Registry>,
    port: u16,
) -> Option<(TcpListener, PortLease)> {
    let lease = registry.lease_port(port)?;
    match TcpListener::bind((config.tunnel_bind_address.as_str(), port)).await {
        Ok(listener) => Some((listener, lease)),
        Err(e) => {
            debug!("Failed to bind port {}: {}", port, e);
            None
        }
    }
}

async fn allocate_any(
    config: &ServerConfig,
    registry: &Arc<Registry>,
) -> Option<(TcpListener, PortLease)> {
    for attempt in 0..MAX_ALLOCATION_ATTEMPTS {
        if attempt >= EPHEMERAL_ATTEMPTS {
            let port = random_port(config).ok()?;
            if let Some(bound) = bind_leased(config, registry, port).await {
                return Some(bound);
            }
            continue;
        }

        let listener = match TcpListener::bind((config.tunnel_bind_address.as_str(), 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Ephemeral bind failed: {}", e);
                continue;
            }
        };
        let Ok(addr) = listener.local_addr() else {
            continue;
        };
        if !config.port_in_range(addr.port()) {
            trace!("Ephemeral port {} outside allowed range, reassigning", addr.port());
            continue;
        }
        if let Some(lease) = registry.lease_port(addr.port()) {
            return Some((listener, lease));
        }
    }

    warn!(
        "No bindable port in {}-{} after {} attempts",
        config.min_port, config.max_port, MAX_ALLOCATION_ATTEMPTS
    );
    None
}

fn random_port(config: &ServerConfig) -> Result<u16, CryptoError> {
    let span = u32::from(config.max_port.saturating_sub(config.min_port)) + 1;
    Ok(config.min_port + (random_u32()? % span) as u16)
}

/// Public listener owned by one control session
pub struct TunnelListener {
    lease: PortLease,
    table: ConnectionTable,
    accept_task: JoinHandle<()>,
}

impl TunnelListener {
    /// Start accepting outsiders on `listener`, announcing each over `sender`
    pub fn start(listener: TcpListener, lease: PortLease, sender: FrameSender) -> Self {
        let table: ConnectionTable = Arc::new(DashMap::new());
        info!("Starting listener on port {}", lease.port());

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&table), sender));

        Self {
            lease,
            table,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Queue `payload` for the outsider with `connection_id`.
    /// Unknown IDs are dropped; the outsider may already be gone.
    pub fn route(&self, connection_id: u32, payload: Bytes) {
        match self.table.get(&connection_id) {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    trace!("Outsider {} is closing, dropping data", connection_id);
                }
            }
            None => trace!("Data for unknown connection {}", connection_id),
        }
    }

    /// Close the outsider with `connection_id` once its queued data is written
    pub fn close_connection(&self, connection_id: u32) {
        if self.table.remove(&connection_id).is_some() {
            debug!("Client closed connection {}", connection_id);
        }
    }

    /// Number of live outsider connections
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Stop accepting and wait until the listening socket is closed, so the
    /// port can be bound again as soon as the lease is released.
    pub async fn close(mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.table.clear();
        info!("Listener on port {} closed", self.lease.port());
    }
}

async fn accept_loop(listener: TcpListener, table: ConnectionTable, sender: FrameSender) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept error: {}", e);
                continue;
            }
        };
        socket.set_nodelay(true).ok();

        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = match register(&table, tx) {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not assign connection ID: {}", e);
                continue;
            }
        };
        debug!("New connection from {} [connectionId: {}]", peer, connection_id);

        if sender.send(Frame::new_connection(connection_id)).await.is_err() {
            // Control socket is gone; the session is tearing down
            return;
        }

        tokio::spawn(relay_outsider(
            connection_id,
            socket,
            rx,
            Arc::clone(&table),
            sender.clone(),
        ));
    }
}

/// Insert `tx` under a fresh random ID, re-rolling on collision
fn register(
    table: &ConnectionTable,
    tx: mpsc::UnboundedSender<Bytes>,
) -> Result<u32, CryptoError> {
    loop {
        let id = random_u32()?;
        if id == CONTROL_CONNECTION_ID {
            continue;
        }
        match table.entry(id) {
            Entry::Occupied(_) => {
                warn!("Connection ID {} collided, re-rolling", id);
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
                return Ok(id);
            }
        }
    }
}

/// Shuttle bytes between one outsider socket and the control session
async fn relay_outsider(
    connection_id: u32,
    socket: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    table: ConnectionTable,
    sender: FrameSender,
) {
    let (mut read_half, mut write_half) = socket.into_split();

    let inbound = async {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    trace!("Data received [connectionId: {}] {} bytes", connection_id, n);
                    if sender.send(Frame::data(connection_id, data)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Outsider {} read error: {}", connection_id, e);
                    break;
                }
            }
        }
    };

    let outbound = async {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                debug!("Outsider {} write error: {}", connection_id, e);
                return;
            }
        }
        write_half.shutdown().await.ok();
    };

    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }

    // Whoever removes the entry reports the close; the client's own close removes it first
    if table.remove(&connection_id).is_some() {
        debug!("Connection closed [connectionId: {}]", connection_id);
        let _ = sender.send(Frame::connection_closed(connection_id)).await;
    }
}
