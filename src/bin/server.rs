//! Conduit Server
//!
//! Accepts control connections from conduit clients, opens a public port
//! for each one and, when a hostname is configured, routes
//! `<subdomain>.<hostname>` to it through the Caddy admin API.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use conduit::{
    config::{generate_example_config, Config, ServerConfig},
    gateway::{CaddyGateway, RouteGateway},
    Server,
};
use std::sync::Arc;
use tracing::info;

/// Conduit Server - expose services behind NAT through public ports
#[derive(Parser, Debug)]
#[command(name = "conduit-server")]
#[command(about = "Conduit Server - expose services behind NAT through public ports")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Control port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind the control listener to (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Address tunnel listeners bind to
    #[arg(long)]
    tunnel_bind: Option<String>,

    /// Lowest port handed to tunnels
    #[arg(long)]
    min_port: Option<u16>,

    /// Highest port handed to tunnels
    #[arg(long)]
    max_port: Option<u16>,

    /// Public hostname; enables subdomain routing
    #[arg(long)]
    hostname: Option<String>,

    /// Shared secret clients must present
    #[arg(long, env = "CONDUIT_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Caddy admin API base URL
    #[arg(long)]
    admin_url: Option<String>,

    /// Seconds between keepalives on active sessions
    #[arg(long)]
    keepalive_interval: Option<u64>,

    /// Seconds of silence before a session is dropped
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example configuration")?;
        println!("{}", example);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config {
            server: Some(ServerConfig::default()),
            ..Config::default()
        },
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let mut server_config = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    apply_overrides(&mut server_config, args);

    let gateway: Option<Arc<dyn RouteGateway>> = match server_config.hostname {
        Some(_) => Some(Arc::new(
            CaddyGateway::new(&server_config.gateway).context("Failed to build gateway client")?,
        )),
        None => None,
    };

    info!("Conduit Server v{}", conduit::VERSION);
    if server_config.secret.is_some() {
        info!("Clients must present the shared secret");
    }

    let server = Server::bind(server_config, gateway)
        .await
        .context("Failed to start server")?;

    tokio::select! {
        result = server.serve() => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut ServerConfig, args: Args) {
    if let Some(port) = args.port {
        config.control_port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(tunnel_bind) = args.tunnel_bind {
        config.tunnel_bind_address = tunnel_bind;
    }
    if let Some(min_port) = args.min_port {
        config.min_port = min_port;
    }
    if let Some(max_port) = args.max_port {
        config.max_port = max_port;
    }
    if args.hostname.is_some() {
        config.hostname = args.hostname;
    }
    if args.secret.is_some() {
        config.secret = args.secret;
    }
    if let Some(admin_url) = args.admin_url {
        config.gateway.admin_url = admin_url;
    }
    if let Some(interval) = args.keepalive_interval {
        config.keepalive_interval = interval;
    }
    if let Some(timeout) = args.idle_timeout {
        config.idle_timeout = timeout;
    }
}
