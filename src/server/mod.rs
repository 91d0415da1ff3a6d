//! Tunnel server
//!
//! Accepts control connections, runs one [`ControlSession`] per client and
//! hands each active session a public listener whose outsiders are
//! multiplexed back over the control socket.

mod registry;
mod router;
mod session;

pub use registry::{PortLease, Registry, SubdomainLease};
pub use router::{allocate, ConnectionTable, TunnelListener};
pub use session::{ControlSession, Phase};

use crate::config::ServerConfig;
use crate::crypto::CryptoError;
use crate::gateway::RouteGateway;
use crate::protocol::{MessageType, ProtocolError};
use crate::transport::TransportError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Errors that end a control session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Client presented the wrong secret")]
    AuthenticationFailed,

    #[error("{0:?} received before authentication")]
    Unauthenticated(MessageType),

    #[error("Handshake did not complete in time")]
    HandshakeTimeout,

    #[error("No traffic from client within the idle timeout")]
    IdleTimeout,
}

/// State shared by every session of one server
pub struct ServerShared {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    gateway: Option<Arc<dyn RouteGateway>>,
}

impl ServerShared {
    pub fn new(
        config: ServerConfig,
        registry: Arc<Registry>,
        gateway: Option<Arc<dyn RouteGateway>>,
    ) -> Self {
        Self {
            config,
            registry,
            gateway,
        }
    }

    /// Hostname and gateway, when subdomain routing is enabled
    pub fn subdomains(&self) -> Option<(&str, &dyn RouteGateway)> {
        let hostname = self.config.hostname.as_deref()?;
        let gateway = self.gateway.as_deref()?;
        Some((hostname, gateway))
    }
}

/// Control server bound to its listening socket
pub struct Server {
    listener: TcpListener,
    shared: Arc<ServerShared>,
}

impl Server {
    /// Bind the control port and prepare the gateway.
    ///
    /// When a hostname is configured the gateway is bootstrapped first; if
    /// that fails subdomain requests are answered UNSUPPORTED for the life
    /// of the process.
    pub async fn bind(
        config: ServerConfig,
        gateway: Option<Arc<dyn RouteGateway>>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.control_addr()).await?;
        let control_port = listener.local_addr()?.port();

        let gateway = match (config.hostname.as_deref(), gateway) {
            (Some(hostname), Some(gateway)) => match gateway.bootstrap(hostname).await {
                Ok(()) => Some(gateway),
                Err(e) => {
                    error!("Failed to initialize reverse proxy: {}", e);
                    warn!("Subdomain support disabled");
                    None
                }
            },
            (Some(_), None) => {
                warn!("Hostname set without a reverse proxy; subdomain support disabled");
                None
            }
            (None, _) => None,
        };

        let mut reserved = vec![config.control_port, control_port];
        reserved.extend(config.gateway.admin_port());
        let registry = Registry::new(reserved);

        Ok(Self {
            listener,
            shared: Arc::new(ServerShared::new(config, registry, gateway)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.shared.registry)
    }

    /// Accept control connections until the task is dropped
    pub async fn serve(self) -> crate::Result<()> {
        info!("Conduit server listening on {}", self.listener.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!("New connection from {}", peer);
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        if let Err(e) = session::run(stream, peer, shared).await {
                            debug!("Session {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}
