//! Reverse-proxy gateway for subdomain routing
//!
//! The server only needs three calls: bootstrap once at startup, then add
//! and remove a `subdomain.hostname -> localhost:port` route as sessions
//! lease and release subdomains. `CaddyGateway` drives a Caddy instance
//! through its admin API.

mod caddy;

pub use caddy::CaddyGateway;

use async_trait::async_trait;
use thiserror::Error;

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response from gateway: {0}")]
    InvalidResponse(String),
}

/// Route management on an HTTP-configurable reverse proxy
#[async_trait]
pub trait RouteGateway: Send + Sync {
    /// Install the base configuration for `hostname`
    async fn bootstrap(&self, hostname: &str) -> Result<(), GatewayError>;

    /// Route `subdomain.hostname` to the tunnel listening on `port`
    async fn add_route(&self, hostname: &str, subdomain: &str, port: u16)
        -> Result<(), GatewayError>;

    /// Remove the route for `subdomain.hostname`. A missing route is not an error.
    async fn remove_route(&self, hostname: &str, subdomain: &str) -> Result<(), GatewayError>;
}
