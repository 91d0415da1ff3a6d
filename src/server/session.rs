//! Server side of a control connection
//!
//! A session moves strictly through key exchange, authentication and port
//! negotiation before it relays any data:
//!
//! ```text
//! AwaitingKey --CRYPTO_EXCHANGE--> AwaitingAuth --SECRET_EXCHANGE--> AwaitingPort
//!                                        |  (no secret configured)        |
//!                                        +--------------------------------+
//!                                                                         |
//!                                     Active <------PORT_REQUEST----------+
//! ```
//!
//! Every frame enters through [`ControlSession::handle_frame`], which is the
//! only place state changes.

use super::registry::SubdomainLease;
use super::router::{self, TunnelListener};
use super::{ServerShared, SessionError};
use crate::crypto::{Cipher, HandshakeRole, KeyExchange};
use crate::protocol::{
    validate_subdomain, MessageType, PortRequest, RequestStatus, SecretStatus,
};
use crate::transport::{open_frame, spawn_reader, spawn_writer, FrameSender, ReaderMessage};
use crate::tunnel::Frame;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// How long a closing session waits for queued frames to reach the socket
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable phase of a control session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingKey,
    AwaitingAuth,
    AwaitingPort,
    Active,
    Closed,
}

enum State {
    AwaitingKey(KeyExchange),
    AwaitingAuth,
    AwaitingPort,
    Active(ActiveTunnel),
    Closed,
}

struct ActiveTunnel {
    listener: TunnelListener,
    subdomain: Option<SubdomainLease>,
}

/// State machine for one client control connection
pub struct ControlSession {
    state: State,
    shared: Arc<ServerShared>,
    sender: FrameSender,
    opener: Option<Cipher>,
    peer: SocketAddr,
}

impl ControlSession {
    /// Create a session that writes through `sender`
    pub fn new(
        shared: Arc<ServerShared>,
        sender: FrameSender,
        peer: SocketAddr,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            state: State::AwaitingKey(KeyExchange::new(HandshakeRole::Responder)?),
            shared,
            sender,
            opener: None,
            peer,
        })
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::AwaitingKey(_) => Phase::AwaitingKey,
            State::AwaitingAuth => Phase::AwaitingAuth,
            State::AwaitingPort => Phase::AwaitingPort,
            State::Active(_) => Phase::Active,
            State::Closed => Phase::Closed,
        }
    }

    /// Port leased by this session, once active
    pub fn port(&self) -> Option<u16> {
        match &self.state {
            State::Active(active) => Some(active.listener.port()),
            _ => None,
        }
    }

    /// Subdomain leased by this session, if any
    pub fn subdomain(&self) -> Option<&str> {
        match &self.state {
            State::Active(active) => active.subdomain.as_ref().map(|lease| lease.name()),
            _ => None,
        }
    }

    /// Send our public key; the first frame of every session
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if let State::AwaitingKey(exchange) = &self.state {
            let key = Bytes::copy_from_slice(exchange.public_key().as_bytes());
            self.sender
                .send(Frame::control(MessageType::CryptoExchange, key))
                .await?;
        }
        Ok(())
    }

    /// Process one frame as received from the wire.
    ///
    /// An error means the session must be closed.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        trace!(
            "Received {:?} [connectionId: {}] {} bytes",
            frame.message_type,
            frame.connection_id,
            frame.payload.len()
        );

        if frame.message_type == MessageType::Keepalive {
            return Ok(());
        }

        if let State::AwaitingKey(_) = self.state {
            return self.on_awaiting_key(frame).await;
        }

        let frame = open_frame(self.opener.as_mut(), frame)?;
        self.dispatch(frame).await
    }

    async fn on_awaiting_key(&mut self, frame: Frame) -> Result<(), SessionError> {
        if frame.message_type != MessageType::CryptoExchange {
            if self.shared.config.secret.is_some() {
                return Err(SessionError::Unauthenticated(frame.message_type));
            }
            warn!(
                "Ignoring {:?} from {} before key exchange",
                frame.message_type, self.peer
            );
            return Ok(());
        }

        let State::AwaitingKey(exchange) = std::mem::replace(&mut self.state, State::Closed)
        else {
            return Ok(());
        };
        let ciphers = exchange.complete(&frame.payload)?;
        self.sender.secure(ciphers.sealer).await?;
        self.opener = Some(ciphers.opener);
        debug!("Session key established with {}", self.peer);

        self.state = if self.shared.config.secret.is_some() {
            State::AwaitingAuth
        } else {
            State::AwaitingPort
        };
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), SessionError> {
        match (self.phase(), frame.message_type) {
            (Phase::AwaitingAuth, MessageType::SecretExchange) => {
                self.on_secret(&frame.payload).await
            }
            (Phase::AwaitingAuth, MessageType::CryptoExchange) => {
                warn!("Ignoring repeated key exchange from {}", self.peer);
                Ok(())
            }
            (Phase::AwaitingAuth, other) => {
                self.send_secret_status(SecretStatus::Rejected).await?;
                Err(SessionError::Unauthenticated(other))
            }
            (Phase::AwaitingPort | Phase::Active, MessageType::SecretExchange)
                if self.shared.config.secret.is_none() =>
            {
                self.send_secret_status(SecretStatus::NotSet).await
            }
            (Phase::AwaitingPort, MessageType::PortRequest) => {
                self.on_port_request(&frame.payload).await
            }
            (Phase::Active, MessageType::SubdomainRequest) => {
                self.on_subdomain_request(&frame.payload).await
            }
            (Phase::Active, MessageType::Data) => {
                if let State::Active(active) = &self.state {
                    active.listener.route(frame.connection_id, frame.payload);
                }
                Ok(())
            }
            (Phase::Active, MessageType::ConnectionClosed) => {
                if let State::Active(active) = &self.state {
                    active.listener.close_connection(frame.connection_id);
                }
                Ok(())
            }
            (phase, message_type) => {
                warn!(
                    "Ignoring {:?} from {} in phase {:?}",
                    message_type, self.peer, phase
                );
                Ok(())
            }
        }
    }

    async fn on_secret(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let matches = self
            .shared
            .config
            .secret
            .as_deref()
            .is_some_and(|secret| secret.as_bytes() == payload);

        if !matches {
            self.send_secret_status(SecretStatus::Rejected).await?;
            return Err(SessionError::AuthenticationFailed);
        }

        self.send_secret_status(SecretStatus::Success).await?;
        self.state = State::AwaitingPort;
        info!("Client {} authenticated", self.peer);
        Ok(())
    }

    async fn on_port_request(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let request = match PortRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Bad port request from {}: {}", self.peer, e);
                return self.send_port_status(RequestStatus::Unavailable).await;
            }
        };

        let shared = Arc::clone(&self.shared);
        let Some((listener, lease)) = router::allocate(&shared.config, &shared.registry, request).await
        else {
            info!("Port request {:?} from {} unavailable", request, self.peer);
            return self.send_port_status(RequestStatus::Unavailable).await;
        };
        let port = lease.port();

        // Reply before accepting so NEW_CONNECTION never precedes the grant
        match request {
            PortRequest::Specific(_) => self.send_port_status(RequestStatus::Success).await?,
            PortRequest::Any => {
                self.sender
                    .send(Frame::control(
                        MessageType::PortAssigned,
                        Bytes::copy_from_slice(&port.to_be_bytes()),
                    ))
                    .await?
            }
        }

        self.state = State::Active(ActiveTunnel {
            listener: TunnelListener::start(listener, lease, self.sender.clone()),
            subdomain: None,
        });
        info!("Client {} tunnelling on port {}", self.peer, port);
        Ok(())
    }

    async fn on_subdomain_request(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let shared = Arc::clone(&self.shared);
        let Some((hostname, gateway)) = shared.subdomains() else {
            return self.send_subdomain_status(RequestStatus::Unsupported).await;
        };
        let State::Active(active) = &mut self.state else {
            return Ok(());
        };

        if active.subdomain.is_some() {
            warn!("Client {} already holds a subdomain", self.peer);
            return self.send_subdomain_status(RequestStatus::Unavailable).await;
        }

        let label = match std::str::from_utf8(payload) {
            Ok(label) if validate_subdomain(label).is_ok() => label,
            _ => {
                warn!("Invalid subdomain requested by {}", self.peer);
                return self.send_subdomain_status(RequestStatus::Unavailable).await;
            }
        };

        let Some(lease) = shared.registry.lease_subdomain(label) else {
            return self.send_subdomain_status(RequestStatus::Unavailable).await;
        };

        let port = active.listener.port();
        if let Err(e) = gateway.add_route(hostname, label, port).await {
            warn!("Failed to add reverse proxy for {}: {}", label, e);
        }
        active.subdomain = Some(lease);
        info!("Subdomain {}.{} routed to port {}", label, hostname, port);

        self.send_subdomain_status(RequestStatus::Success).await
    }

    async fn send_secret_status(&self, status: SecretStatus) -> Result<(), SessionError> {
        self.send_status(MessageType::SecretExchange, status as u8).await
    }

    async fn send_port_status(&self, status: RequestStatus) -> Result<(), SessionError> {
        self.send_status(MessageType::PortResponse, status as u8).await
    }

    async fn send_subdomain_status(&self, status: RequestStatus) -> Result<(), SessionError> {
        self.send_status(MessageType::SubdomainResponse, status as u8).await
    }

    async fn send_status(&self, message_type: MessageType, status: u8) -> Result<(), SessionError> {
        self.sender
            .send(Frame::control(message_type, vec![status]))
            .await?;
        Ok(())
    }

    /// Release everything the session holds. Safe to call more than once.
    pub async fn close(&mut self) {
        let State::Active(active) = std::mem::replace(&mut self.state, State::Closed) else {
            return;
        };

        if let (Some(lease), Some((hostname, gateway))) =
            (&active.subdomain, self.shared.subdomains())
        {
            if let Err(e) = gateway.remove_route(hostname, lease.name()).await {
                warn!("Failed to remove reverse proxy for {}: {}", lease.name(), e);
            }
        }

        let ActiveTunnel {
            listener,
            subdomain,
        } = active;
        listener.close().await;
        drop(subdomain);
    }

    fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// Run the session until the peer leaves or something fatal happens
    async fn drive(&mut self, rx: &mut mpsc::Receiver<ReaderMessage>) -> Result<(), SessionError> {
        self.start().await?;

        let config = &self.shared.config;
        let idle_timeout = config.idle_timeout();
        let handshake_deadline = tokio::time::sleep(config.handshake_timeout());
        tokio::pin!(handshake_deadline);

        let period = config.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(ReaderMessage::Frames(frames)) => {
                        last_seen = Instant::now();
                        for frame in frames {
                            self.handle_frame(frame).await?;
                        }
                    }
                    Some(ReaderMessage::Error(e)) => return Err(SessionError::Stream(e)),
                    Some(ReaderMessage::Closed) | None => {
                        info!("Connection closed from {}", self.peer);
                        return Ok(());
                    }
                },
                _ = &mut handshake_deadline, if !self.is_active() => {
                    return Err(SessionError::HandshakeTimeout);
                }
                _ = keepalive.tick(), if self.is_active() => {
                    self.sender.send(Frame::keepalive()).await?;
                }
                _ = tokio::time::sleep_until(last_seen + idle_timeout) => {
                    return Err(SessionError::IdleTimeout);
                }
            }
        }
    }
}

/// Serve one accepted control connection to completion
pub async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
) -> Result<(), SessionError> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let (sender, mut writer) = spawn_writer(write_half);
    let (mut rx, reader) = spawn_reader(read_half);

    let result = match ControlSession::new(shared, sender.clone(), peer) {
        Ok(mut session) => {
            let result = session.drive(&mut rx).await;
            if let Err(e) = &result {
                error!("Session with {} failed: {}", peer, e);
            }
            session.close().await;
            result
        }
        Err(e) => Err(e),
    };

    reader.abort();
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
        sender.shutdown().await;
        let _ = (&mut writer).await;
    })
    .await;
    if flushed.is_err() {
        writer.abort();
    }

    result
}
