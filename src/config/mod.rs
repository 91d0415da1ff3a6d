//! Configuration management

use crate::protocol::{validate_subdomain, CONTROL_PORT, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, KEEPALIVE_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control listener binds to
    pub bind_address: String,
    /// Control port clients connect to
    pub control_port: u16,
    /// Address tunnel listeners bind to
    pub tunnel_bind_address: String,
    /// Lowest port a tunnel may be given
    pub min_port: u16,
    /// Highest port a tunnel may be given
    pub max_port: u16,
    /// Public hostname; enables subdomain routing when set
    pub hostname: Option<String>,
    /// Shared secret; clients must present it when set
    pub secret: Option<String>,
    /// Seconds between keepalive frames on an active session
    pub keepalive_interval: u64,
    /// Seconds of silence after which a session is considered dead
    pub idle_timeout: u64,
    /// Seconds a new session has to finish negotiating a port
    pub handshake_timeout: u64,
    /// Reverse-proxy gateway
    pub gateway: GatewayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            control_port: CONTROL_PORT,
            tunnel_bind_address: "0.0.0.0".to_string(),
            min_port: 1024,
            max_port: 65535,
            hostname: None,
            secret: None,
            keepalive_interval: KEEPALIVE_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            gateway: GatewayConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check the configuration for values that can never work
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(crate::Error::Config(format!(
                "Invalid port range {}-{}",
                self.min_port, self.max_port
            )));
        }
        if let Some(hostname) = &self.hostname {
            if hostname.trim().is_empty() {
                return Err(crate::Error::Config("Hostname must not be empty".to_string()));
            }
        }
        if self.keepalive_interval == 0 || self.idle_timeout <= self.keepalive_interval {
            return Err(crate::Error::Config(
                "idle_timeout must be longer than keepalive_interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `port` lies in the allowed tunnel range
    pub fn port_in_range(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port)
    }

    /// Control listener address
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.control_port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

/// Reverse-proxy admin API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the Caddy admin API
    pub admin_url: String,
    /// Certificate presented for the hostname and its subdomains
    pub cert_file: String,
    /// Private key for `cert_file`
    pub key_file: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            admin_url: "http://localhost:2019".to_string(),
            cert_file: "/etc/caddy/certs/domain.cert.pem".to_string(),
            key_file: "/etc/caddy/certs/private.key.pem".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Port of the admin API, which must never be handed to a tunnel
    pub fn admin_port(&self) -> Option<u16> {
        let authority = self
            .admin_url
            .split("://")
            .nth(1)
            .unwrap_or(&self.admin_url)
            .split('/')
            .next()?;
        authority.rsplit_once(':')?.1.parse().ok()
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server hostname
    pub server: String,
    /// Server control port
    pub control_port: u16,
    /// Host of the local service being exposed
    pub local_host: String,
    /// Port of the local service being exposed
    pub local_port: u16,
    /// Specific remote port to request; server picks one when unset
    pub remote_port: Option<u16>,
    /// Subdomain to request
    pub subdomain: Option<String>,
    /// Shared secret for servers that require one
    pub secret: Option<String>,
    /// Keep the session open indefinitely instead of for 24 hours
    pub keep_alive: bool,
    /// Seconds between keepalive frames
    pub keepalive_interval: u64,
    /// Seconds of silence after which the server is considered gone
    pub idle_timeout: u64,
    /// Seconds to wait for TCP connects
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "conduit.ws".to_string(),
            control_port: CONTROL_PORT,
            local_host: "localhost".to_string(),
            local_port: 8080,
            remote_port: None,
            subdomain: None,
            secret: None,
            keep_alive: false,
            keepalive_interval: KEEPALIVE_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
            connect_timeout: 10,
        }
    }
}

/// How long a session lasts without `keep_alive`
pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

impl ClientConfig {
    /// Normalize and check the configuration.
    ///
    /// A subdomain given as `foo.<server>` is reduced to `foo`.
    pub fn validate(&mut self) -> Result<(), crate::Error> {
        if let Some(subdomain) = self.subdomain.take() {
            let suffix = format!(".{}", self.server);
            let label = subdomain
                .strip_suffix(&suffix)
                .unwrap_or(&subdomain)
                .to_string();
            validate_subdomain(&label).map_err(|_| {
                crate::Error::Config(
                    "Subdomain must be alphanumeric (letters, numbers, and hyphens only)"
                        .to_string(),
                )
            })?;
            self.subdomain = Some(label);
        }
        if self.keepalive_interval == 0 || self.idle_timeout <= self.keepalive_interval {
            return Err(crate::Error::Config(
                "idle_timeout must be longer than keepalive_interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Control server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.control_port)
    }

    /// Local service address
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Maximum session length, if any
    pub fn session_lifetime(&self) -> Option<Duration> {
        (!self.keep_alive).then_some(DEFAULT_SESSION_LIFETIME)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}
