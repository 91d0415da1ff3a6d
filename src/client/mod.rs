//! Tunnel client
//!
//! Connects to a conduit server, negotiates a public port (and optionally a
//! subdomain), then relays every outsider connection the server announces
//! to the configured local service.

mod session;
mod tunnel;

pub use session::ClientSession;
pub use tunnel::{spawn_local_tunnel, LocalEvent, LocalTunnel};

use crate::config::ClientConfig;
use crate::crypto::CryptoError;
use crate::protocol::ProtocolError;
use crate::transport::{connect, spawn_reader, spawn_writer, ReaderMessage, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

/// How long to wait for queued frames to reach the server on exit
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Authentication failed: the server rejected our secret")]
    AuthenticationRejected,

    #[error("Requested port {0:?} is unavailable")]
    PortUnavailable(Option<u16>),

    #[error("Subdomain {0} is unavailable")]
    SubdomainUnavailable(String),

    #[error("The server does not support subdomains")]
    SubdomainUnsupported,

    #[error("Server closed the connection during setup")]
    Closed,

    #[error("No traffic from server within the idle timeout")]
    IdleTimeout,
}

/// Client session phase, as seen by observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientPhase {
    #[default]
    Connecting,
    AwaitingKey,
    AwaitingAuth,
    AwaitingPort,
    AwaitingSubdomain,
    Active,
    Closed,
}

/// Snapshot published while the client runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatus {
    pub phase: ClientPhase,
    pub assigned_port: Option<u16>,
    pub subdomain: Option<String>,
}

/// Tunnel client
pub struct Client {
    config: ClientConfig,
    status: watch::Sender<ClientStatus>,
}

impl Client {
    /// Create a client from a validated configuration
    pub fn new(mut config: ClientConfig) -> crate::Result<Self> {
        config.validate()?;
        let (status, _) = watch::channel(ClientStatus::default());
        Ok(Self { config, status })
    }

    /// Subscribe to status updates
    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.status.subscribe()
    }

    /// Connect and relay until the server goes away, a fatal error occurs,
    /// or the session lifetime runs out
    pub async fn run(self) -> Result<(), ClientError> {
        let addr = self.config.server_addr();
        info!("Connecting to conduit server at {}...", addr);
        let stream = connect(&addr, self.config.connect_timeout()).await?;

        let (read_half, write_half) = stream.into_split();
        let (sender, mut writer) = spawn_writer(write_half);
        let (mut rx, reader) = spawn_reader(read_half);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let idle_timeout = self.config.idle_timeout();
        let period = self.config.keepalive_interval();
        let lifetime = self.config.session_lifetime();

        let mut session = ClientSession::new(self.config, sender.clone(), events_tx, self.status)?;
        let result = drive(&mut session, &mut rx, &mut events_rx, idle_timeout, period, lifetime).await;
        session.close();

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
}

async fn drive(
    session: &mut ClientSession,
    rx: &mut mpsc::Receiver<ReaderMessage>,
    events: &mut mpsc::UnboundedReceiver<LocalEvent>,
    idle_timeout: Duration,
    keepalive_period: Duration,
    lifetime: Option<Duration>,
) -> Result<(), ClientError> {
    session.start().await?;

    let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive_period, keepalive_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end_of_life = tokio::time::sleep(lifetime.unwrap_or(Duration::MAX));
    tokio::pin!(end_of_life);

    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(ReaderMessage::Frames(frames)) => {
                    last_seen = Instant::now();
                    for frame in frames {
                        session.handle_frame(frame).await?;
                    }
                }
                Some(ReaderMessage::Error(e)) => return Err(ClientError::Stream(e)),
                Some(ReaderMessage::Closed) | None => {
                    info!("Connection with the conduit server has closed");
                    return if session.has_port() {
                        Ok(())
                    } else {
                        Err(ClientError::Closed)
                    };
                }
            },
            Some(event) = events.recv() => {
                session.handle_event(event).await?;
            }
            _ = keepalive.tick(), if session.has_port() => {
                session.send_keepalive().await?;
            }
            _ = tokio::time::sleep_until(last_seen + idle_timeout) => {
                return Err(ClientError::IdleTimeout);
            }
            _ = &mut end_of_life, if lifetime.is_some() => {
                warn!("Session lifetime reached; use keep_alive to stay connected");
                return Ok(());
            }
        }
    }
}
