//! # Conduit
//!
//! Expose a TCP service running behind a NAT or firewall through a public
//! server.
//!
//! A client opens one control connection to the server. After an X25519 key
//! exchange (and an optional shared-secret check) the server opens a public
//! port for the client. Every outsider that connects to that port becomes a
//! numbered connection multiplexed over the control socket, and the client
//! relays it to the local service. When a hostname and a reverse-proxy
//! gateway are configured, clients may also claim `<subdomain>.<hostname>`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Server / Client sessions               │
//! │     (handshake state machines, tunnel relaying)     │
//! ├─────────────────────────────────────────────────────┤
//! │           Router, registry and gateway              │
//! │  (public listeners, port/subdomain leases, routes)  │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                     │
//! │   (socket reader/writer tasks, frame sealing)       │
//! ├─────────────────────────────────────────────────────┤
//! │               Framing and crypto                    │
//! │  (frame codec, stream parser, ChaCha20-Poly1305)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod gateway;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use client::Client;
pub use config::Config;
pub use server::Server;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] gateway::GatewayError),

    #[error("Session error: {0}")]
    Session(#[from] server::SessionError),

    #[error("Client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("Configuration error: {0}")]
    Config(String),
}
