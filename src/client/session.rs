//! Client side of the control connection

use super::tunnel::{spawn_local_tunnel, LocalEvent, LocalTunnel};
use super::{ClientError, ClientPhase, ClientStatus};
use crate::config::ClientConfig;
use crate::crypto::{Cipher, HandshakeRole, KeyExchange};
use crate::protocol::{
    decode_assigned_port, MessageType, PortRequest, RequestStatus, SecretStatus,
};
use crate::transport::{open_frame, FrameSender};
use crate::tunnel::Frame;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

enum State {
    AwaitingKey(KeyExchange),
    AwaitingAuth,
    AwaitingPort,
    AwaitingSubdomain,
    Active,
    Closed,
}

/// Client session state machine and local tunnel table
pub struct ClientSession {
    config: ClientConfig,
    state: State,
    sender: FrameSender,
    opener: Option<Cipher>,
    tunnels: HashMap<u32, LocalTunnel>,
    tasks: JoinSet<()>,
    events: mpsc::UnboundedSender<LocalEvent>,
    status: watch::Sender<ClientStatus>,
}

impl ClientSession {
    pub fn new(
        config: ClientConfig,
        sender: FrameSender,
        events: mpsc::UnboundedSender<LocalEvent>,
        status: watch::Sender<ClientStatus>,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            config,
            state: State::AwaitingKey(KeyExchange::new(HandshakeRole::Initiator)?),
            sender,
            opener: None,
            tunnels: HashMap::new(),
            tasks: JoinSet::new(),
            events,
            status,
        })
    }

    pub fn phase(&self) -> ClientPhase {
        match self.state {
            State::AwaitingKey(_) => ClientPhase::AwaitingKey,
            State::AwaitingAuth => ClientPhase::AwaitingAuth,
            State::AwaitingPort => ClientPhase::AwaitingPort,
            State::AwaitingSubdomain => ClientPhase::AwaitingSubdomain,
            State::Active => ClientPhase::Active,
            State::Closed => ClientPhase::Closed,
        }
    }

    /// Whether the tunnel port has been granted
    pub fn has_port(&self) -> bool {
        matches!(self.state, State::AwaitingSubdomain | State::Active)
    }

    /// Buffered payload count for a tunnel still connecting
    pub fn pending_len(&self, connection_id: u32) -> Option<usize> {
        self.tunnels.get(&connection_id)?.pending_len()
    }

    /// Number of tracked local tunnels
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    fn set_phase(&mut self, state: State) {
        self.state = state;
        let phase = self.phase();
        self.status.send_modify(|status| status.phase = phase);
    }

    /// Send our public key to the server
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if let State::AwaitingKey(exchange) = &self.state {
            let key = Bytes::copy_from_slice(exchange.public_key().as_bytes());
            self.sender
                .send(Frame::control(MessageType::CryptoExchange, key))
                .await?;
        }
        Ok(())
    }

    /// Process one frame as received from the wire
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        trace!(
            "Received {:?} [connectionId: {}] {} bytes",
            frame.message_type,
            frame.connection_id,
            frame.payload.len()
        );

        if let State::AwaitingKey(_) = self.state {
            if frame.message_type == MessageType::CryptoExchange {
                return self.on_server_key(&frame.payload).await;
            }
            if frame.message_type != MessageType::Keepalive {
                warn!("Ignoring {:?} before key exchange", frame.message_type);
            }
            return Ok(());
        }

        let frame = open_frame(self.opener.as_mut(), frame)?;
        self.dispatch(frame).await
    }

    async fn on_server_key(&mut self, server_key: &[u8]) -> Result<(), ClientError> {
        let State::AwaitingKey(exchange) = std::mem::replace(&mut self.state, State::Closed)
        else {
            return Ok(());
        };
        let ciphers = exchange.complete(server_key)?;
        self.sender.secure(ciphers.sealer).await?;
        self.opener = Some(ciphers.opener);
        debug!("Session key established");

        match self.config.secret.clone() {
            Some(secret) => {
                debug!("Authenticating with shared secret");
                self.sender
                    .send(Frame::control(MessageType::SecretExchange, secret.into_bytes()))
                    .await?;
                self.set_phase(State::AwaitingAuth);
                Ok(())
            }
            None => self.request_port().await,
        }
    }

    async fn request_port(&mut self) -> Result<(), ClientError> {
        let request = PortRequest::from(self.config.remote_port);
        self.sender
            .send(Frame::control(MessageType::PortRequest, request.encode()))
            .await?;
        self.set_phase(State::AwaitingPort);
        Ok(())
    }

    /// Route a decrypted frame
    async fn dispatch(&mut self, frame: Frame) -> Result<(), ClientError> {
        match frame.message_type {
            MessageType::Keepalive => Ok(()),
            MessageType::SecretExchange => self.on_secret_status(&frame.payload).await,
            MessageType::PortResponse | MessageType::PortAssigned
                if matches!(self.state, State::AwaitingPort) =>
            {
                self.on_port_reply(&frame).await
            }
            MessageType::SubdomainResponse if matches!(self.state, State::AwaitingSubdomain) => {
                self.on_subdomain_reply(&frame.payload)
            }
            MessageType::NewConnection if self.has_port() => {
                self.open_tunnel(frame.connection_id);
                Ok(())
            }
            MessageType::Data if self.has_port() => {
                match self.tunnels.get_mut(&frame.connection_id) {
                    Some(tunnel) => {
                        if tunnel.pending_len().is_some() {
                            trace!(
                                "Local tunnel {} is not open, buffering data",
                                frame.connection_id
                            );
                        }
                        tunnel.push(frame.payload);
                    }
                    None => trace!("Data for unknown connection {}", frame.connection_id),
                }
                Ok(())
            }
            MessageType::ConnectionClosed if self.has_port() => {
                let id = frame.connection_id;
                match self.tunnels.get_mut(&id) {
                    Some(tunnel) if tunnel.pending_len().is_some() => {
                        debug!("Server closed connection {}, closing after flush", id);
                        tunnel.close_after_flush();
                    }
                    Some(_) => {
                        // Dropping the sender lets the local task drain its queue and shut down
                        self.tunnels.remove(&id);
                        debug!("Server closed connection {}", id);
                    }
                    None => trace!("Close for unknown connection {}", id),
                }
                Ok(())
            }
            other => {
                warn!("Ignoring {:?} in phase {:?}", other, self.phase());
                Ok(())
            }
        }
    }

    async fn on_secret_status(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        match SecretStatus::from_payload(payload)? {
            SecretStatus::Rejected => Err(ClientError::AuthenticationRejected),
            status if matches!(self.state, State::AwaitingAuth) => {
                if status == SecretStatus::NotSet {
                    warn!("Server does not require a secret");
                } else {
                    info!("Authenticated successfully");
                }
                self.request_port().await
            }
            status => {
                debug!("Ignoring secret status {:?} in phase {:?}", status, self.phase());
                Ok(())
            }
        }
    }

    async fn on_port_reply(&mut self, frame: &Frame) -> Result<(), ClientError> {
        let port = match frame.message_type {
            MessageType::PortAssigned => decode_assigned_port(&frame.payload)?,
            _ => match RequestStatus::from_payload(frame.message_type, &frame.payload)? {
                RequestStatus::Success => self.config.remote_port.unwrap_or_default(),
                _ => return Err(ClientError::PortUnavailable(self.config.remote_port)),
            },
        };
        if port == 0 {
            return Err(ClientError::PortUnavailable(None));
        }

        info!(
            "Connected to {}; tunnel available at {}:{}",
            self.config.server, self.config.server, port
        );
        self.status
            .send_modify(|status| status.assigned_port = Some(port));

        match self.config.subdomain.clone() {
            Some(subdomain) => {
                self.sender
                    .send(Frame::control(
                        MessageType::SubdomainRequest,
                        subdomain.into_bytes(),
                    ))
                    .await?;
                self.set_phase(State::AwaitingSubdomain);
            }
            None => self.set_phase(State::Active),
        }
        Ok(())
    }

    fn on_subdomain_reply(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        let subdomain = self.config.subdomain.clone().unwrap_or_default();
        match RequestStatus::from_payload(MessageType::SubdomainResponse, payload)? {
            RequestStatus::Success => {
                info!("Acquired subdomain {}.{}", subdomain, self.config.server);
                self.status
                    .send_modify(|status| status.subdomain = Some(subdomain));
                self.set_phase(State::Active);
                Ok(())
            }
            RequestStatus::Unavailable => Err(ClientError::SubdomainUnavailable(subdomain)),
            RequestStatus::Unsupported => Err(ClientError::SubdomainUnsupported),
        }
    }

    fn open_tunnel(&mut self, connection_id: u32) {
        if self.tunnels.contains_key(&connection_id) {
            warn!("Duplicate NEW_CONNECTION for {}", connection_id);
            return;
        }
        debug!("New connection {} from server", connection_id);

        // Reap finished tunnel tasks
        while self.tasks.try_join_next().is_some() {}

        self.tunnels.insert(connection_id, LocalTunnel::connecting());
        spawn_local_tunnel(
            &mut self.tasks,
            connection_id,
            self.config.local_addr(),
            self.config.connect_timeout(),
            self.sender.clone(),
            self.events.clone(),
        );
    }

    /// Apply the outcome of a local tunnel task
    pub async fn handle_event(&mut self, event: LocalEvent) -> Result<(), ClientError> {
        match event {
            LocalEvent::Connected { connection_id, tx } => {
                match self.tunnels.get_mut(&connection_id) {
                    Some(tunnel) if tunnel.is_closing() => {
                        tunnel.open(tx);
                        self.tunnels.remove(&connection_id);
                        debug!("Flushed local tunnel {} after server close", connection_id);
                    }
                    Some(tunnel) => tunnel.open(tx),
                    // Dropping `tx` ends the task
                    None => debug!("Local tunnel {} no longer wanted", connection_id),
                }
                Ok(())
            }
            LocalEvent::Failed { connection_id, .. } | LocalEvent::Closed { connection_id } => {
                match self.tunnels.remove(&connection_id) {
                    Some(tunnel) if tunnel.is_closing() => {
                        debug!("Local tunnel {} failed after server close", connection_id);
                    }
                    Some(_) => {
                        debug!("Local tunnel {} closed", connection_id);
                        self.sender
                            .send(Frame::connection_closed(connection_id))
                            .await?;
                    }
                    None => {}
                }
                Ok(())
            }
        }
    }

    pub async fn send_keepalive(&self) -> Result<(), ClientError> {
        self.sender.send(Frame::keepalive()).await?;
        Ok(())
    }

    /// Drop every local tunnel and mark the session closed
    pub fn close(&mut self) {
        self.tunnels.clear();
        self.tasks.abort_all();
        self.set_phase(State::Closed);
    }
}
